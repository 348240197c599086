pub mod ask;

use anyhow::{Context, Result, bail};
use std::path::Path;

use crate::config::FileConfig;
use ask::AskOptions;

/// `relay ask`: stream one answer to stdout; fail if it did not complete.
pub async fn ask(message: &str, options: AskOptions) -> Result<()> {
    let outcome = ask::ask_command(message, &options).await?;
    if let relay_wire::TurnOutcome::Incomplete { reason, .. } = &outcome {
        eprintln!("{}", outcome.display_text());
        bail!("response incomplete: {}", reason);
    }
    Ok(())
}

/// `relay config`: print the effective configuration as TOML.
pub fn print_config(path: &Path) -> Result<()> {
    let config = FileConfig::load(path)?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    print!("{}", rendered);
    Ok(())
}
