use crate::error::TransferError;
use crate::transfer::constants::{MAX_FILE_SIZE, MAX_FILENAME_LENGTH};
use std::path::Path;
use tokio::fs::{File, OpenOptions};

const FALLBACK_NAME: &str = "unknown_file";

/// Validate an announced file against size and name length limits
pub fn validate_transfer_info(file_name: &str, file_size: u64) -> Result<(), TransferError> {
    if file_size > MAX_FILE_SIZE {
        return Err(TransferError::TooLarge {
            size: file_size,
            limit: MAX_FILE_SIZE,
        });
    }

    if file_name.len() > MAX_FILENAME_LENGTH {
        return Err(TransferError::NameTooLong {
            len: file_name.len(),
            max: MAX_FILENAME_LENGTH,
        });
    }
    Ok(())
}

/// Create (or truncate) a file with owner-only permissions on Unix
pub async fn open_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    options.open(path).await
}

/// Reduce an announced name to a safe single path component
pub fn sanitize_file_name(file_name: &str) -> String {
    // Last component only, whatever the separator style
    let file_name = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(FALLBACK_NAME);

    let mut clean_name: String = file_name.chars().filter(|c| !c.is_control()).collect();

    // https://learn.microsoft.com/en-us/windows/win32/fileio/naming-a-file
    let reserved_names = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    if reserved_names
        .iter()
        .any(|r| clean_name.eq_ignore_ascii_case(r))
    {
        return FALLBACK_NAME.to_string();
    }

    if clean_name == ".." || clean_name == "." || clean_name.trim().is_empty() {
        return FALLBACK_NAME.to_string();
    }

    if clean_name.len() > MAX_FILENAME_LENGTH {
        clean_name = truncate_keeping_extension(&clean_name);
    }

    clean_name
}

fn truncate_keeping_extension(name: &str) -> String {
    if let Some(idx) = name.rfind('.') {
        let ext_len = name.len() - idx;
        if ext_len < 20 {
            let mut base = name[..idx].to_string();
            truncate_at_char_boundary(&mut base, MAX_FILENAME_LENGTH - ext_len);
            base.push_str(&name[idx..]);
            return base;
        }
    }

    let mut truncated = name.to_string();
    truncate_at_char_boundary(&mut truncated, MAX_FILENAME_LENGTH);
    truncated
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    let mut cutoff = max.min(s.len());
    while !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    s.truncate(cutoff);
}
