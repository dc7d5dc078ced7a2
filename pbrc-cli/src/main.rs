// CLI application
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pbrc_cli::commands::{build_script, check_script};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "pbrc")]
#[command(about = "PBR script compiler for PowerPC")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Validate a script without producing outputs
    Check {
        /// Path to the .pbr script
        script: PathBuf,
    },
    /// Compile a script to .asm and .bin at a load address
    Build {
        /// Path to the .pbr script
        script: PathBuf,

        /// Load address (e.g. 0x80001800)
        #[arg(short, long, value_parser = parse_address)]
        address: u32,

        /// Also write a <name>.stats.json build summary
        #[arg(long)]
        emit_stats: bool,
    },
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Check { script } => check_script(&script),
        Commands::Build {
            script,
            address,
            emit_stats,
        } => {
            let pb = create_progress_bar("Building...");
            let result = build_script(&script, address, emit_stats);
            pb.finish_and_clear();
            result
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn parse_address(text: &str) -> Result<u32, String> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u32::from_str_radix(digits, 16).map_err(|_| format!("invalid address '{}'", text))
}

fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(message.to_string());
    pb
}
