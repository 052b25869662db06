//! Purpose: `sheetport` CLI entry point.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: stdout carries only command output (run report, type descriptors, completions).
//! Invariants: Logs go to stderr; non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
#![allow(clippy::result_large_err)]
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use sheetport::config::{Config, ConfigOverrides, DEFAULT_CONFIG};
use sheetport::core::encode::Format;
use sheetport::core::grammar::parse_type;
use sheetport::hook::LuaHooks;
use sheetport::source::XlsxSource;
use sheetport::{Error, ErrorKind, Exporter, to_exit_code};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `sheetport --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    command_dispatch::dispatch_command(cli.command)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

/// Accepts the single-dash long flags older build scripts pass (`-conf x`, `-name T`).
fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            let replacement = arg.to_str().and_then(|value| match value {
                "-conf" | "-cpu" | "-src" | "-out" | "-name" => Some(format!("-{value}")),
                _ => None,
            });
            replacement.map(OsString::from).unwrap_or(arg)
        })
        .collect()
}

#[derive(Parser)]
#[command(
    name = "sheetport",
    version,
    about = "Export typed spreadsheet tables to Lua and JSON data files",
    long_about = None,
    after_help = r#"EXAMPLES
  $ sheetport export                          # uses ./conf.json
  $ sheetport export --conf tools/conf.json --name Item --name Shop
  $ sheetport export --format json --cpu 4
  $ sheetport types 'List(Int)' 'Dict(id:Int,rate:Float=1)'

Column types are declared in the first header row of every sheet; see `sheetport types`."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Export every configured table",
        long_about = r#"Read each table definition from the config, export it, then run the
global cache script (hook/GlobalProcess.lua) if present and rewrite changed tables.

Prints a JSON run report on stdout."#
    )]
    Export {
        #[arg(long, default_value = DEFAULT_CONFIG, value_hint = ValueHint::FilePath, help = "Config file")]
        conf: PathBuf,
        #[arg(long, help = "Worker threads (0 = half the cores)")]
        cpu: Option<usize>,
        #[arg(long, value_hint = ValueHint::DirPath, help = "Override the source directory")]
        src: Option<PathBuf>,
        #[arg(long, value_hint = ValueHint::DirPath, help = "Override the output directory")]
        out: Option<PathBuf>,
        #[arg(long = "hook-dir", value_hint = ValueHint::DirPath, help = "Directory holding Lua hooks")]
        hook_dir: Option<PathBuf>,
        #[arg(long, value_enum, help = "Output format")]
        format: Option<Format>,
        #[arg(long = "name", help = "Export only this table (repeatable)")]
        names: Vec<String>,
    },
    #[command(
        about = "Parse column type declarations and print them as JSON",
        after_help = r#"EXAMPLES
  $ sheetport types Int=3 'Enum(Low:1,High:2)=High' 'List(Dict(id:Int,n:Int=1))'"#
    )]
    Types {
        #[arg(required = true, help = "Type declaration text, as written in a header cell")]
        decls: Vec<String>,
    },
    #[command(about = "Generate shell completions")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn emit_json(value: &Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() || err.kind() != ErrorKind::Io {
        return err;
    }
    err.with_hint("I/O error. Check the path, permissions, and disk space.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share the config if it persists.",
    )
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn colorize_label(label: &str, enabled: bool, code: &str) -> String {
    if !enabled {
        return label.to_string();
    }
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::Config => "invalid configuration",
        ErrorKind::SourceMissing => "source not found",
        ErrorKind::Read => "failed to read source",
        ErrorKind::Grammar => "malformed type declaration",
        ErrorKind::Conversion => "cell does not match its declared type",
        ErrorKind::DuplicateResult => "duplicate table result",
        ErrorKind::Engine => "script engine failure",
        ErrorKind::Io => "i/o error",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(table) = err.table() {
        inner.insert("table".to_string(), json!(table));
    }
    if let Some(row) = err.row() {
        inner.insert("row".to_string(), json!(row));
    }
    if let Some(column) = err.column() {
        inner.insert("column".to_string(), json!(column));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = vec![format!(
        "{} {}",
        colorize_label("error:", use_color, "31"),
        error_message(err)
    )];
    let mut location = Vec::new();
    if let Some(table) = err.table() {
        location.push(format!("table {table}"));
    }
    if let Some(row) = err.row() {
        location.push(format!("row {row}"));
    }
    if let Some(column) = err.column() {
        location.push(format!("column {column}"));
    }
    if !location.is_empty() {
        lines.push(format!(
            "{} {}",
            colorize_label("at:", use_color, "33"),
            location.join(", ")
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, "33"),
            path.display()
        ));
    }
    if let Some(hint) = err.hint() {
        lines.push(format!("{} {hint}", colorize_label("hint:", use_color, "33")));
    }
    for cause in error_causes(err) {
        lines.push(format!("{} {cause}", colorize_label("caused by:", use_color, "33")));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use super::{Cli, error_json, normalize_args};
    use clap::CommandFactory;
    use sheetport::{Error, ErrorKind};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn single_dash_long_flags_are_normalized() {
        let args = ["sheetport", "export", "-conf", "c.json", "-name", "Item", "-x"]
            .map(OsString::from);
        let normalized = normalize_args(args);
        assert_eq!(
            normalized,
            ["sheetport", "export", "--conf", "c.json", "--name", "Item", "-x"].map(OsString::from)
        );
    }

    #[test]
    fn error_json_carries_cell_context() {
        let err = Error::new(ErrorKind::Conversion)
            .with_message("cannot convert `x` to Int")
            .with_table("Item")
            .with_row(7)
            .with_column("hp");
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "Conversion");
        assert_eq!(value["error"]["table"], "Item");
        assert_eq!(value["error"]["row"], 7);
        assert_eq!(value["error"]["column"], "hp");
        assert!(value["error"].get("hint").is_none());
    }
}
