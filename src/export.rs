//! Purpose: Run one export: schedule tables, fan out to workers, then run the cache rewrite pass.
//! Exports: `Exporter`, `Phase`, `RunReport`.
//! Role: Single driver that decides abort-vs-continue for every error a task reports.
//! Invariants: Phases advance Idle, Scheduling, PrimaryRunning, Barrier, then SecondaryRunning or Done.
//! Invariants: The task queue is filled and closed before any worker starts.
//! Invariants: Every dispatched task reports exactly one outcome before the barrier.
//! Invariants: Stored results are never mutated; rewrites work on copies with the captured orderings.
//! Notes: Tables finished before a failure keep their output; the run still fails.
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::TableDef;
use crate::core::encode::{Format, encode};
use crate::core::error::{Error, ErrorKind};
use crate::core::output::write_table;
use crate::core::table::{TableExport, read_table};
use crate::hook::{HookBridge, ScriptEngine};
use crate::source::SourceAdapter;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    Scheduling,
    PrimaryRunning,
    Barrier,
    SecondaryRunning,
    Done,
}

impl Phase {
    fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Idle, Phase::Scheduling)
                | (Phase::Scheduling, Phase::PrimaryRunning)
                | (Phase::PrimaryRunning, Phase::Barrier)
                | (Phase::Barrier, Phase::SecondaryRunning)
                | (Phase::Barrier, Phase::Done)
                | (Phase::SecondaryRunning, Phase::Done)
        )
    }
}

#[derive(Debug)]
struct PhaseTracker {
    current: Phase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            current: Phase::Idle,
        }
    }

    fn advance(&mut self, next: Phase) -> Result<(), Error> {
        if !self.current.can_advance_to(next) {
            return Err(Error::new(ErrorKind::Internal).with_message(format!(
                "illegal export phase transition {:?} -> {:?}",
                self.current, next
            )));
        }
        debug!(from = ?self.current, to = ?next, "export phase");
        self.current = next;
        Ok(())
    }
}

/// Summary of a completed run, printed by the CLI.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RunReport {
    pub exported: Vec<String>,
    pub skipped: Vec<String>,
    pub rewritten: Vec<String>,
}

struct Task {
    def: TableDef,
    cache_dependent: bool,
}

enum TaskOutcome {
    Exported(TableExport),
    Skipped(String),
    Failed(String, Error),
    Aborted(String),
}

pub struct Exporter<'a> {
    source: &'a dyn SourceAdapter,
    hooks: &'a dyn HookBridge,
    out_dir: PathBuf,
    format: Format,
    workers: usize,
}

impl<'a> Exporter<'a> {
    pub fn new(
        source: &'a dyn SourceAdapter,
        hooks: &'a dyn HookBridge,
        out_dir: impl Into<PathBuf>,
        format: Format,
    ) -> Self {
        Self {
            source,
            hooks,
            out_dir: out_dir.into(),
            format,
            workers: 1,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Exports `tables` (or the `only` subset of them) and runs the cache rewrite pass.
    pub fn run(&self, tables: &[TableDef], only: &[String]) -> Result<RunReport, Error> {
        let mut phase = PhaseTracker::new();
        let mut report = RunReport::default();

        phase.advance(Phase::Scheduling)?;
        let tasks = self.schedule(tables, only, &mut report)?;

        phase.advance(Phase::PrimaryRunning)?;
        let workers = self.workers.clamp(1, tasks.len().max(1));
        info!(tables = tasks.len(), workers, "primary export started");
        let (results, first_error) = self.run_primary(tasks, workers, &mut report);

        phase.advance(Phase::Barrier)?;
        if let Some(err) = first_error {
            return Err(err);
        }
        report.exported = results.keys().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        info!(exported = report.exported.len(), skipped = report.skipped.len(), "primary export finished");

        let cache = self.hooks.cache();
        if !cache.is_enabled() {
            phase.advance(Phase::Done)?;
            return Ok(report);
        }

        phase.advance(Phase::SecondaryRunning)?;
        cache.process_all()?;
        let changed = cache.get_changed()?;
        for (table, rows) in &changed {
            let Some(stored) = results.get(table) else {
                warn!(table = %table, "changed table was not exported in this run; ignored");
                continue;
            };
            let mut export = stored.clone();
            let applied = export.data.apply_changes(table, rows)?;
            let encoded = encode(self.format, &export)?;
            write_table(&self.out_dir, table, self.format, &encoded)?;
            info!(table = %table, rows = applied, "rewrote table");
            report.rewritten.push(table.clone());
        }

        phase.advance(Phase::Done)?;
        Ok(report)
    }

    fn schedule(
        &self,
        tables: &[TableDef],
        only: &[String],
        report: &mut RunReport,
    ) -> Result<Vec<Task>, Error> {
        for name in only {
            if !tables.iter().any(|def| &def.name == name) {
                warn!(table = %name, "requested table is not defined; ignored");
            }
        }
        let mut seen = BTreeSet::new();
        for def in tables {
            if !only.is_empty() && !only.contains(&def.name) {
                continue;
            }
            if !seen.insert(def.name.as_str()) {
                return Err(Error::new(ErrorKind::DuplicateResult)
                    .with_message("table is defined more than once")
                    .with_table(def.name.clone())
                    .with_hint("Give every data_def entry a distinct name."));
            }
        }
        fs::create_dir_all(&self.out_dir).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to create output directory")
                .with_path(&self.out_dir)
                .with_source(err)
        })?;

        let wanted = self.hooks.cache().init()?;
        let mut tasks = Vec::with_capacity(tables.len());
        for def in tables {
            if !only.is_empty() && !only.contains(&def.name) {
                continue;
            }
            if !self.source.exists(def) {
                warn!(table = %def.name, excel = %def.excel, "source not found; table skipped");
                report.skipped.push(def.name.clone());
                continue;
            }
            tasks.push(Task {
                cache_dependent: wanted.contains(&def.name),
                def: def.clone(),
            });
        }
        for name in &wanted {
            if !tasks.iter().any(|task| &task.def.name == name) {
                debug!(table = %name, "cache wants a table that is not scheduled");
            }
        }
        Ok(tasks)
    }

    fn run_primary(
        &self,
        tasks: Vec<Task>,
        workers: usize,
        report: &mut RunReport,
    ) -> (HashMap<String, TableExport>, Option<Error>) {
        let (task_tx, task_rx) = mpsc::sync_channel::<Task>(tasks.len());
        for task in tasks {
            // Capacity equals the task count, so this never blocks.
            let _ = task_tx.send(task);
        }
        drop(task_tx);

        let queue = Mutex::new(task_rx);
        let abort = AtomicBool::new(false);
        let (result_tx, result_rx) = mpsc::channel::<TaskOutcome>();
        let mut results: HashMap<String, TableExport> = HashMap::new();
        let mut first_error: Option<Error> = None;

        thread::scope(|scope| {
            let queue = &queue;
            let abort = &abort;
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let result_tx = result_tx.clone();
                    scope.spawn(move || self.worker_loop(worker, queue, result_tx, abort))
                })
                .collect();
            drop(result_tx);

            for outcome in result_rx {
                match outcome {
                    TaskOutcome::Exported(export) => {
                        if results.contains_key(&export.name) {
                            abort.store(true, Ordering::SeqCst);
                            first_error.get_or_insert_with(|| {
                                Error::new(ErrorKind::DuplicateResult)
                                    .with_message("table exported more than once")
                                    .with_table(export.name.clone())
                            });
                        } else {
                            results.insert(export.name.clone(), export);
                        }
                    }
                    TaskOutcome::Skipped(name) => report.skipped.push(name),
                    TaskOutcome::Failed(name, err) => {
                        error!(table = %name, error = %err, "table export failed");
                        first_error.get_or_insert(err);
                    }
                    TaskOutcome::Aborted(name) => {
                        debug!(table = %name, "table not started after an earlier failure");
                    }
                }
            }

            for handle in handles {
                if handle.join().is_err() {
                    first_error.get_or_insert_with(|| {
                        Error::new(ErrorKind::Internal).with_message("export worker panicked")
                    });
                }
            }
        });

        (results, first_error)
    }

    fn worker_loop(
        &self,
        worker: usize,
        queue: &Mutex<Receiver<Task>>,
        results: Sender<TaskOutcome>,
        abort: &AtomicBool,
    ) {
        let mut engine: Option<Box<dyn ScriptEngine>> = None;
        loop {
            let next = queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv();
            let Ok(task) = next else {
                break;
            };
            let name = task.def.name.clone();
            let outcome = if abort.load(Ordering::SeqCst) {
                TaskOutcome::Aborted(name)
            } else {
                debug!(worker, table = %name, "task started");
                match self.export_table(&task, &mut engine) {
                    Ok(export) => TaskOutcome::Exported(export),
                    Err(err) if !err.kind().is_fatal() => {
                        warn!(table = %name, error = %err, "source vanished; table skipped");
                        TaskOutcome::Skipped(name)
                    }
                    Err(err) => {
                        abort.store(true, Ordering::SeqCst);
                        TaskOutcome::Failed(name, err)
                    }
                }
            };
            if results.send(outcome).is_err() {
                break;
            }
        }
    }

    fn export_table(
        &self,
        task: &Task,
        slot: &mut Option<Box<dyn ScriptEngine>>,
    ) -> Result<TableExport, Error> {
        let def = &task.def;
        let rows = self.source.rows(def)?;

        let mut engine = match slot.take() {
            Some(engine) => engine,
            None => self.hooks.worker_engine()?,
        };
        let data = read_table(&def.name, def.is_map, &rows, engine.as_mut());
        *slot = Some(engine);

        let export = TableExport {
            name: def.name.clone(),
            one_row_one_file: def.one_row_one_file,
            data: data?,
        };
        let encoded = encode(self.format, &export)?;
        write_table(&self.out_dir, &def.name, self.format, &encoded)
            .map_err(|err| err.or_context(&def.name, None, None))?;
        if task.cache_dependent {
            self.hooks
                .cache()
                .receive(&def.name, &export.data.to_value())
                .map_err(|err| err.or_context(&def.name, None, None))?;
        }
        info!(table = %def.name, rows = export.data.len(), "exported table");
        Ok(export)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{Exporter, Phase, PhaseTracker, RunReport};
    use crate::config::TableDef;
    use crate::core::encode::Format;
    use crate::core::error::ErrorKind;
    use crate::hook::NoHooks;
    use crate::source::MemorySource;

    fn item_rows(id: &str) -> Vec<Vec<String>> {
        [vec!["Int", "Str"], vec![], vec!["id", "name"], vec![id, "thing"]]
            .into_iter()
            .map(|row| row.into_iter().map(String::from).collect())
            .collect()
    }

    fn source(count: usize) -> (MemorySource, Vec<TableDef>) {
        let mut source = MemorySource::new();
        let mut defs = Vec::new();
        for idx in 0..count {
            let name = format!("T{idx}");
            source.insert(&name, item_rows(&idx.to_string()));
            defs.push(TableDef::new(name, "unused.xlsx"));
        }
        (source, defs)
    }

    #[test]
    fn phases_only_move_forward() {
        let mut phase = PhaseTracker::new();
        assert_eq!(phase.advance(Phase::PrimaryRunning).unwrap_err().kind(), ErrorKind::Internal);
        for next in [Phase::Scheduling, Phase::PrimaryRunning, Phase::Barrier, Phase::Done] {
            phase.advance(next).unwrap();
        }
        assert!(phase.advance(Phase::SecondaryRunning).is_err());
    }

    #[test]
    fn fan_out_yields_one_result_per_table_for_any_pool_size() {
        const TABLES: usize = 6;
        for workers in 1..=TABLES {
            let dir = tempfile::tempdir().expect("tempdir");
            let (source, defs) = source(TABLES);
            let report = Exporter::new(&source, &NoHooks, dir.path(), Format::Lua)
                .with_workers(workers)
                .run(&defs, &[])
                .unwrap();
            let mut expected: Vec<String> = defs.iter().map(|def| def.name.clone()).collect();
            expected.sort();
            assert_eq!(report.exported, expected, "workers = {workers}");
            assert!(report.skipped.is_empty());
            for def in &defs {
                assert!(dir.path().join(format!("{}.lua", def.name)).is_file());
            }
        }
    }

    #[test]
    fn missing_sources_are_skipped_and_subsets_filter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (source, mut defs) = source(2);
        defs.push(TableDef::new("Ghost", "ghost.xlsx"));

        let report = Exporter::new(&source, &NoHooks, dir.path(), Format::Json)
            .run(&defs, &[])
            .unwrap();
        assert_eq!(report.exported, ["T0", "T1"]);
        assert_eq!(report.skipped, ["Ghost"]);

        let dir = tempfile::tempdir().expect("tempdir");
        let report = Exporter::new(&source, &NoHooks, dir.path(), Format::Json)
            .run(&defs, &["T1".to_string(), "Nope".to_string()])
            .unwrap();
        assert_eq!(
            report,
            RunReport {
                exported: vec!["T1".to_string()],
                ..RunReport::default()
            }
        );
        assert!(!dir.path().join("T0.json").exists());
    }

    #[test]
    fn duplicate_table_names_are_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (source, mut defs) = source(1);
        defs.push(defs[0].clone());
        for workers in [1, 2, 4] {
            let out = dir.path().join(format!("out{workers}"));
            let err = Exporter::new(&source, &NoHooks, &out, Format::Lua)
                .with_workers(workers)
                .run(&defs, &[])
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::DuplicateResult);
            assert_eq!(err.table(), Some("T0"));
            assert!(!out.exists(), "nothing is written before scheduling completes");
        }

        let report = Exporter::new(&source, &NoHooks, dir.path().join("subset"), Format::Lua)
            .run(&defs, &["Other".to_string()])
            .unwrap();
        assert!(report.exported.is_empty());
    }

    #[test]
    fn a_failed_table_fails_the_run_and_stops_later_tasks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut source = MemorySource::new();
        source.insert("Bad", item_rows("not-a-number"));
        source.insert("Good", item_rows("1"));
        let defs = vec![
            TableDef::new("Bad", "bad.xlsx"),
            TableDef::new("Good", "good.xlsx"),
        ];
        let err = Exporter::new(&source, &NoHooks, dir.path(), Format::Lua)
            .with_workers(1)
            .run(&defs, &[])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conversion);
        assert_eq!(err.table(), Some("Bad"));
        assert!(!dir.path().join("Good.lua").exists());
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
