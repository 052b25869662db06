//! Purpose: Hold top-level CLI command dispatch for `sheetport`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Each command writes one JSON document (or completions) to stdout on success.

use super::*;

pub(super) fn dispatch_command(command: Command) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "sheetport", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Types { decls } => {
            let mut described = Vec::with_capacity(decls.len());
            for text in &decls {
                let decl = parse_type(text)?;
                described.push(json!({
                    "text": text,
                    "canonical": decl.to_string(),
                    "decl": decl.describe(),
                }));
            }
            emit_json(&Value::Array(described));
            Ok(RunOutcome::ok())
        }
        Command::Export {
            conf,
            cpu,
            src,
            out,
            hook_dir,
            format,
            names,
        } => {
            init_tracing();
            let options = Config::load(&conf)?.resolve(ConfigOverrides {
                cpu,
                src,
                out,
                hook_dir,
                format,
                names,
            })?;
            tracing::info!(
                config = %conf.display(),
                tables = options.tables.len(),
                format = %options.format,
                workers = options.workers,
                "export starting"
            );
            let hooks = LuaHooks::new(&options.hook_dir)?;
            let source = XlsxSource::new(&options.src_dir);
            let report = Exporter::new(&source, &hooks, &options.out_dir, options.format)
                .with_workers(options.workers)
                .run(&options.tables, &options.only)?;
            let value = serde_json::to_value(&report).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode run report")
                    .with_source(err)
            })?;
            emit_json(&value);
            Ok(RunOutcome::ok())
        }
    }
}
