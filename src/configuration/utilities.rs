use std::path::PathBuf;

use miette::{miette, Context, IntoDiagnostic, Result};


/// The default configuration file location:
/// `./data/configuration.toml`, relative to the current directory.
pub fn get_default_configuration_file_path() -> Result<PathBuf> {
    let current_directory = std::env::current_dir()
        .into_diagnostic()
        .wrap_err_with(|| miette!("Failed to get the current directory."))?;

    Ok(current_directory.join("data").join("configuration.toml"))
}
