//! Command line argument parsing and mode selection
//!
//! The flag combination picks the mode: `--src` + `--dst` transmit,
//! `--src` alone save, `--img` + `--dst` upload, `--watch` turns a
//! transmit run into the polling loop.

use crate::error::{Result, TransmitError};
use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "image-transmit",
    version,
    about = "Transmit container images between registries, online or through offline archives"
)]
pub struct Args {
    /// Source repository name from cfg.yaml
    #[arg(long)]
    pub src: Option<String>,

    /// Destination repository name from cfg.yaml
    #[arg(long)]
    pub dst: Option<String>,

    /// Image list file, one image each line (stdin when omitted)
    #[arg(long)]
    pub lst: Option<String>,

    /// Referred image meta file (*_meta.yaml) for an incremental save
    #[arg(long)]
    pub inc: Option<String>,

    /// Image meta file (*_meta.yaml) to upload
    #[arg(long)]
    pub img: Option<String>,

    /// Output filename prefix
    #[arg(long)]
    pub out: Option<String>,

    /// Watch mode: poll source repositories for new tags
    #[arg(long)]
    pub watch: bool,
}

/// What this invocation is going to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Transmit,
    Watch,
    Save,
    Upload,
}

impl Args {
    pub fn parse_args() -> Args {
        <Args as Parser>::parse()
    }

    pub fn mode(&self) -> Result<Mode> {
        let has = |o: &Option<String>| o.as_deref().is_some_and(|s| !s.is_empty());
        if has(&self.src) && has(&self.dst) {
            if self.watch {
                Ok(Mode::Watch)
            } else {
                Ok(Mode::Transmit)
            }
        } else if has(&self.img) && has(&self.dst) {
            Ok(Mode::Upload)
        } else if has(&self.src) {
            Ok(Mode::Save)
        } else {
            Err(TransmitError::Config(
                "invalid args, please refer to the help".to_string(),
            ))
        }
    }
}
