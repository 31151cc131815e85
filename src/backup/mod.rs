pub mod cancel;
pub mod job;
pub mod mount;
pub mod remote;
pub mod result_error;
pub mod settings;
pub mod upload;
pub mod validate;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
