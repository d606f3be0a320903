//! Platform-specific data locations

use std::path::PathBuf;

/// Get the platform-specific data directory for storing notes and session state
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\GravityNotes
/// - macOS: ~/Library/Application Support/GravityNotes
/// - Linux/Other: ~/.local/share/GravityNotes
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("GravityNotes")
}

/// Ensure the data directory exists
pub fn ensure_data_dir() -> std::io::Result<PathBuf> {
    let dir = get_data_dir();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
