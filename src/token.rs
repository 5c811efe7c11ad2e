use std::io;
use std::path::{Path, PathBuf};

use rand::Rng;

/// Length of handshake tokens and of the random suffix of token file names.
pub const TOKEN_LEN: usize = 8;

/// File name prefix for token files written during a login round trip.
pub const TOKEN_FILE_PREFIX: &str = ".rexec_token-";

/// Lowercase only: token file names may land on case-insensitive shares.
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Produces short random strings for challenges and file names.
///
/// Uniqueness between concurrent attempts is all that matters here, so the
/// thread-local RNG is good enough.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenGenerator;

impl TokenGenerator {
    pub fn generate(&self, len: usize) -> String {
        let mut rng = rand::thread_rng();
        (0..len)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }

    /// A fresh token of the standard length.
    pub fn token(&self) -> String {
        self.generate(TOKEN_LEN)
    }

    /// Pick a token file path inside `dir`.
    pub fn file_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}{}", TOKEN_FILE_PREFIX, self.token()))
    }
}

/// RAII guard for a written token file.
///
/// The file is removed when the guard is dropped, whatever happened to the
/// handshake in between.
#[derive(Debug)]
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    /// Write `token` to `path` and take ownership of the file.
    pub fn create(path: PathBuf, token: &str) -> io::Result<Self> {
        std::fs::write(&path, token)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TokenFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), ?e, "failed to remove token file");
        }
    }
}
