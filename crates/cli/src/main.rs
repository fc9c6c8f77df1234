//! cellprobe — command-line client for the oracle server.

mod client;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use cellprobe_engine::AccessedSet;

use crate::client::OracleClient;

#[derive(Parser)]
#[command(name = "cellprobe")]
#[command(about = "Client for the cellprobe spreadsheet oracle server")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(long, global = true, default_value = "127.0.0.1:8000")]
    addr: String,

    /// Auth token
    #[arg(long, global = true, env = "CELLPROBE_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a document and print its handle
    Upload {
        /// Document file
        file: PathBuf,
    },

    /// Print the full structural snapshot of a stored document
    Extract {
        handle: String,

        /// Bypass the server-side cache
        #[arg(long)]
        nocache: bool,
    },

    /// Evaluate a formula as if typed into a cell
    #[command(after_help = "\
Examples:
  cellprobe eval <handle> 'SUM(A1:A3)' --sheet Sheet1
  cellprobe eval <handle> 'GET.WORKSPACE(1)' --col B --row 2 --accessed state.json")]
    Eval {
        handle: String,

        /// Formula, without the leading '='
        formula: String,

        #[arg(long, default_value = "Sheet1")]
        sheet: String,

        /// Target cell column letters
        #[arg(long, default_value = "A")]
        col: String,

        /// Target cell row (1-based)
        #[arg(long, default_value_t = 1)]
        row: u32,

        /// JSON file holding the accessed set from a previous call
        #[arg(long, value_name = "FILE")]
        accessed: Option<PathBuf>,
    },

    /// Indexed cell-property lookup
    CellInfo {
        handle: String,
        sheet: String,
        /// Column letters
        col: String,
        /// Row (1-based)
        row: u32,
        /// Property index
        index: u32,

        /// Bypass the server-side cache
        #[arg(long)]
        nocache: bool,
    },

    /// Indexed workbook-property lookup
    WorkbookInfo {
        handle: String,
        /// Property index
        index: u32,

        /// Bypass the server-side cache
        #[arg(long)]
        nocache: bool,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("cellprobe: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let token = cli
        .token
        .ok_or("no token: pass --token or set CELLPROBE_TOKEN")?;
    let mut client = OracleClient::connect(&cli.addr, &token).map_err(|e| e.to_string())?;

    match cli.command {
        Commands::Upload { file } => {
            let bytes = std::fs::read(&file)
                .map_err(|e| format!("cannot read {}: {e}", file.display()))?;
            let handle = client.upload(&bytes).map_err(|e| e.to_string())?;
            println!("{handle}");
        }
        Commands::Extract { handle, nocache } => {
            let snapshot = client.extract(&handle, nocache).map_err(|e| e.to_string())?;
            print_json(&snapshot)?;
        }
        Commands::Eval { handle, formula, sheet, col, row, accessed } => {
            let accessed = match accessed {
                Some(path) => {
                    let contents = std::fs::read_to_string(&path)
                        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
                    serde_json::from_str::<AccessedSet>(&contents)
                        .map_err(|e| format!("bad accessed set in {}: {e}", path.display()))?
                }
                None => AccessedSet::default(),
            };
            let evaluated = client
                .evaluate(&handle, &sheet, &col, row, &formula, accessed)
                .map_err(|e| e.to_string())?;
            print_json(&evaluated)?;
        }
        Commands::CellInfo { handle, sheet, col, row, index, nocache } => {
            let value = client
                .cell_info(&handle, &sheet, &col, row, index, nocache)
                .map_err(|e| e.to_string())?;
            print_json(&value)?;
        }
        Commands::WorkbookInfo { handle, index, nocache } => {
            let value = client
                .workbook_info(&handle, index, nocache)
                .map_err(|e| e.to_string())?;
            print_json(&value)?;
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}
