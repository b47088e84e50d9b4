use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Pack every regular file of a directory into a fresh image
    Pack {
        /// Source directory
        #[arg(long, short)]
        source: PathBuf,

        /// Output image
        #[arg(long, short)]
        out: PathBuf,

        /// Image size in 512-byte blocks
        #[arg(long, default_value_t = 2048)]
        blocks: usize,

        /// Maximum number of files, root directory included
        #[arg(long, default_value_t = sfs::DEFAULT_INODES)]
        inodes: usize,
    },

    /// List the files of an image
    Ls {
        image: PathBuf,

        /// Blocks to mount, the whole image by default
        #[arg(long)]
        blocks: Option<usize>,
    },

    /// Print a file of an image to stdout
    Cat {
        image: PathBuf,
        name: String,

        #[arg(long)]
        blocks: Option<usize>,
    },

    /// Remove a file from an image
    Rm {
        image: PathBuf,
        name: String,

        #[arg(long)]
        blocks: Option<usize>,
    },
}
