use std::path::PathBuf;

use clap::Parser;

/// Command line configuration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "9090")]
    pub port: u16,

    /// Root directory served by the built-in filesystem binding
    #[arg(long, default_value = ".")]
    pub root_dir: PathBuf,

    /// Maximum number of bytes returned by a single read
    #[arg(long, default_value = "32768")]
    pub max_read_size: u32,
}
