//! CLI command definitions

use clap::Args;

/// Run a pipeline once against an inbound request built from the arguments
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Pipeline (function group) to run
    #[arg(short, long)]
    pub pipeline: String,

    /// Run only this step and its children
    #[arg(long)]
    pub step: Option<String>,

    /// Inbound JSON body, or @path to read it from a file
    #[arg(short, long)]
    pub body: Option<String>,

    /// Inbound method
    #[arg(short, long, default_value = "POST")]
    pub method: String,

    /// Inbound headers (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub header: Vec<(String, String)>,

    /// Inbound query parameters (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub query: Vec<(String, String)>,

    /// SQLite database for async hand-offs
    #[arg(long)]
    pub db: Option<String>,
}

/// Validate a project configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Resume one deferred step by its async id
#[derive(Debug, Args, Clone)]
pub struct ResumeCommand {
    #[arg(long)]
    pub async_id: String,

    /// SQLite database for async hand-offs
    #[arg(long)]
    pub db: Option<String>,
}

/// Poll a queue and resume every deferred step found on it
#[derive(Debug, Args, Clone)]
pub struct ConsumeCommand {
    /// Queue to poll; the default queue when absent
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Max messages per poll
    #[arg(long, default_value_t = 10)]
    pub max: usize,

    /// SQLite database for async hand-offs
    #[arg(long)]
    pub db: Option<String>,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}
