use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Compiles an rsync style exclude file into a glob set matched against
/// paths relative to the source root.
///
/// `/pattern` is anchored at the root, anything else matches at any depth.
/// A match on a directory also covers everything below it.
pub fn load_exclude_file(path: &Path) -> Result<GlobSet> {
    let content = std::fs::read_to_string(path)
        .map_err(Error::from)
        .add_msg(format!("Reading exclude file {:?} failed", path))?;
    build_excludes(content.lines())
}

pub fn build_excludes<'a, I: IntoIterator<Item = &'a str>>(lines: I) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let pattern = line.trim_end_matches('/');
        let (this, below) = match pattern.strip_prefix('/') {
            Some(anchored) => (anchored.to_string(), format!("{}/**", anchored)),
            None => (format!("**/{}", pattern), format!("**/{}/**", pattern)),
        };
        for glob in [this, below] {
            builder.add(
                GlobBuilder::new(&glob)
                    .literal_separator(true)
                    .build()
                    .map_err(Error::from)
                    .add_msg(format!("Invalid exclude pattern {:?}", line))?,
            );
        }
    }
    Ok(builder.build()?)
}
