use clap::{Args, ArgAction};

#[derive(Debug, Args)]
#[clap(next_help_heading = "Global Options")]
pub struct GlobalOpts {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(long, short, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Explicit tracing filter, overrides -v and RUST_LOG (e.g. "psx=debug,r3000=trace")
    #[arg(long, global = true)]
    pub log_filter: Option<String>,
}

impl GlobalOpts {
    /// The filter directive a subscriber should be built with
    pub fn log_directive(&self) -> String {
        if let Some(filter) = &self.log_filter {
            return filter.clone();
        }
        match self.verbose {
            0 => std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned()),
            1 => "debug".to_owned(),
            _ => "trace".to_owned(),
        }
    }
}
