//! Persistent key-value settings stored as YAML in the configuration directory.
//!
//! Unknown keys are kept as is so a saved file round trips. Typed views
//! (`UploadConfig`, the shell commands, the mount validator) are derived from
//! the same map on demand.

use crate::backup::function_path;
use crate::backup::job::rsync::RsyncCommand;
use crate::backup::job::tar::{Compression, TarCommand};
use crate::backup::mount::{MountTableMatch, MountValidator, DEFAULT_MOUNT_TABLE};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::upload::config::UploadConfig;

use function_name::named;
use getset::Getters;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yml::{Mapping, Value};
use std::ffi::OsString;
use std::fs::{DirBuilder, File};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use validator::Validate;

pub static DEFAULT_CONF_DIR: &str = "/etc/backuply";
pub static DEFAULT_CONF_FILE: &str = "backuply.conf";
pub static CLIENT_SECRETS_FILE: &str = "client_secrets.json";

#[derive(Clone, Debug, Getters)]
pub struct Settings {
    #[getset(get = "pub")]
    conf_dir: PathBuf,
    #[getset(get = "pub")]
    conf_file: PathBuf,
    raw: Mapping,
}

impl Settings {
    /// Reads `<conf_dir>/backuply.conf`, creating `conf_dir` if needed.
    /// A missing or empty file gives empty settings.
    #[named]
    pub fn load<P: AsRef<Path>>(conf_dir: P) -> Result<Self> {
        let conf_dir = conf_dir.as_ref().to_path_buf();
        if !conf_dir.exists() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(&conf_dir)
                .map_err(Error::from)
                .add_msg(format!("Creating config directory {:?} failed", conf_dir))
                .add_fn_name(function_path!())?;
            tracing::info!("Created config directory {:?}", conf_dir);
        }

        let conf_file = conf_dir.join(DEFAULT_CONF_FILE);
        let raw = match std::fs::read_to_string(&conf_file) {
            Ok(content) if content.trim().is_empty() => Mapping::new(),
            Ok(content) => serde_yml::from_str::<Option<Mapping>>(&content)
                .map_err(Error::from)
                .add_msg(format!("Parse YAML config failed: {:?}", conf_file))
                .add_fn_name(function_path!())?
                .unwrap_or_default(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No config file at {:?}, using defaults", conf_file);
                Mapping::new()
            }
            Err(e) => {
                return Err(Error::from(e)
                    .add_msg(format!("Reading config {:?} failed", conf_file))
                    .add_fn_name(function_path!()))
            }
        };

        Ok(Self {
            conf_dir,
            conf_file,
            raw,
        })
    }

    /// Value of `key`, or `default` when unset or null.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        match self.raw.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => serde_yml::from_value(value.clone())
                .map_err(Error::from)
                .add_msg(format!("Invalid value for setting {:?}", key)),
        }
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        let value = serde_yml::to_value(value)?;
        self.raw.insert(Value::String(key.to_string()), value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    #[named]
    pub fn save(&self) -> Result<()> {
        let file = File::create(&self.conf_file)
            .map_err(Error::from)
            .add_msg(format!("Writing config {:?} failed", self.conf_file))
            .add_fn_name(function_path!())?;
        serde_yml::to_writer(file, &self.raw)?;
        tracing::debug!("Saved config {:?}", self.conf_file);
        Ok(())
    }

    pub fn upload_config(&self) -> Result<UploadConfig> {
        let config: UploadConfig = serde_yml::from_value(Value::Mapping(self.raw.clone()))
            .map_err(Error::from)
            .add_msg("Invalid upload settings")?;
        config
            .validate()
            .map_err(Error::from)
            .add_msg("Invalid upload settings")?;
        Ok(config)
    }

    pub fn mount_validator(&self) -> Result<MountValidator> {
        Ok(MountValidator::builder()
            .mount_table(self.get("mount_table", PathBuf::from(DEFAULT_MOUNT_TABLE))?)
            .match_mode(self.get("mount_match", MountTableMatch::default())?)
            .build())
    }

    pub fn rsync_command(&self, incremental: bool) -> Result<RsyncCommand> {
        Ok(RsyncCommand::builder()
            .incremental(incremental)
            .extra_args(os_strings(self.get("rsync_extra_args", vec![])?))
            .build())
    }

    pub fn tar_command(&self, overwrite: bool) -> Result<TarCommand> {
        Ok(TarCommand::builder()
            .overwrite(overwrite)
            .compress(self.get("tar_compress", true)?)
            .compression(self.get("tar_compression", Compression::default())?)
            .extra_excludes(self.get::<Vec<PathBuf>>("tar_extra_excludes", vec![])?)
            .extra_args(os_strings(self.get("tar_extra_args", vec![])?))
            .build())
    }

    /// Copies a client secrets file into the config directory unless it is
    /// already there. Returns the installed location.
    #[named]
    pub fn install_client_secrets(&self, src: &Path) -> Result<PathBuf> {
        let dst = self.conf_dir.join(CLIENT_SECRETS_FILE);
        if !src.exists() {
            return Err(Error::precondition(
                libc::ENOENT,
                format!("The client secrets file {:?} does not exist.", src),
            ));
        }

        if src.parent() != Some(self.conf_dir.as_path()) {
            std::fs::copy(src, &dst)
                .map_err(Error::from)
                .add_msg(format!("Copying {:?} to {:?} failed", src, dst))
                .add_fn_name(function_path!())?;
            tracing::info!("Installed client secrets {:?} to {:?}", src, dst);
        }
        Ok(dst)
    }
}

fn os_strings(args: Vec<String>) -> Vec<OsString> {
    args.into_iter().map(OsString::from).collect()
}
