use clap::Parser;

const HELP_EPILOG: &str = r#"Server options can also be provided via environment variables:
  CONFIG_PATH (default: ./config.yaml)
  DB_PATH     (default: data/app.db)
  PORT        (default: 5660 or config.listen_port)
"#;

#[derive(Debug, Parser)]
#[command(
    name = "focusflow-server",
    version,
    about = "FocusFlow server",
    long_about = None,
    after_long_help = HELP_EPILOG,
)]
pub struct Cli {
    /// Path to the YAML config file (overrides CONFIG_PATH)
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
}
