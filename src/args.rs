use clap::Parser;
use std::path::PathBuf;

use classroom_rtc::config;

#[derive(Parser, Debug)]
#[command(name = "classroom-rtc")]
#[command(author = "Classroom RTC Team")]
#[command(version)]
#[command(about = "Headless classroom participant over WebRTC", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/classroom-rtc.toml")]
    pub config: PathBuf,

    /// Signaling hub URL (overrides the config file)
    #[arg(short, long)]
    pub url: Option<String>,

    /// Room to join
    #[arg(short, long)]
    pub room: String,

    /// Application user id announced on join
    #[arg(long)]
    pub user_id: Option<String>,

    /// Display name sent to peers
    #[arg(short, long)]
    pub name: Option<String>,

    /// Join as the meeting host
    #[arg(long, action)]
    pub host: bool,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Apply command line overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut config::Config) {
        if let Some(ref url) = self.url {
            config.signaling.url = url.clone();
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}
