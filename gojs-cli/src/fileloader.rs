use gojs_host::log;
use std::{env, path::PathBuf};
use thiserror::Error;

/// First four bytes of every WebAssembly binary.
const WASM_MAGIC: &[u8; 4] = b"\0asm";

#[derive(Debug, Error)]
pub enum Error {
    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),
    #[error("File {path} not found: {message}", path = path.display())]
    FileNotFound { message: String, path: PathBuf },
    #[error("{} is not a WebAssembly module", path.display())]
    NotWasm { path: PathBuf },
}

/// Resolve `relpath` against the directory of `current_file_or_dir`.
pub fn get_canonical_path(current_file_or_dir: &str, relpath: &str) -> Result<PathBuf, Error> {
    let parent_dir = get_parent_dir(current_file_or_dir)?;
    let abspath = [parent_dir, PathBuf::from(relpath)]
        .into_iter()
        .collect::<PathBuf>();
    abspath.canonicalize().map_err(|e| Error::FileNotFound {
        message: e.to_string(),
        path: abspath,
    })
}

fn get_parent_dir(current_file: &str) -> Result<PathBuf, Error> {
    let current_filepath = std::path::Path::new(current_file);
    if current_filepath.is_dir() {
        Ok(current_filepath.into())
    } else {
        let cwd = env::current_dir()?;
        Ok(current_filepath.parent().map_or_else(|| cwd, PathBuf::from))
    }
}

/// Read a module binary, rejecting files without the wasm magic number.
pub fn load_module(canonical_path: &str) -> Result<Vec<u8>, Error> {
    let path = PathBuf::from(canonical_path);
    let content = std::fs::read(&path).map_err(|e| Error::FileNotFound {
        message: e.to_string(),
        path: path.clone(),
    })?;
    if !content.starts_with(WASM_MAGIC) {
        return Err(Error::NotWasm { path });
    }
    log::debug!("loaded {} ({} bytes)", path.display(), content.len());
    Ok(content)
}
