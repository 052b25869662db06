// Secondary-phase tests: only tables named by the global script are rewritten.
use std::fs;
use std::path::Path;

use sheetport::config::TableDef;
use sheetport::core::encode::Format;
use sheetport::hook::{HookBridge, LuaHooks, NoHooks};
use sheetport::source::MemorySource;
use sheetport::{ErrorKind, Exporter, RunReport};

fn source() -> MemorySource {
    MemorySource::new()
        .with_table(
            "A",
            [
                vec!["Str", "Int", "Float"],
                vec![],
                vec!["key", "value", "rate"],
                vec!["r1", "10", "0.5"],
                vec!["r2", "20", "1.5"],
            ],
        )
        .with_table(
            "B",
            [
                vec!["Int", "Str"],
                vec![],
                vec!["id", "label"],
                vec!["7", "seven"],
            ],
        )
}

fn defs() -> Vec<TableDef> {
    vec![TableDef::new("A", "A.xlsx"), TableDef::new("B", "B.xlsx")]
}

fn export(out: &Path, hooks: &dyn HookBridge, format: Format) -> RunReport {
    let source = source();
    Exporter::new(&source, hooks, out, format)
        .with_workers(2)
        .run(&defs(), &[])
        .expect("export")
}

fn hooks_with_global(dir: &Path, script: &str) -> LuaHooks {
    fs::write(dir.join("GlobalProcess.lua"), script).expect("write script");
    LuaHooks::new(dir).expect("hooks")
}

const RECORDING: &str = r#"
local received = {}
function GlobalCacheDataList() return {"A"} end
function ReceiveCacheData(name, data) received[name] = data end
function ProcessCacheData()
    if received.B ~= nil then error("B is not cache-dependent") end
    if received.A == nil then error("A was never received") end
end
"#;

#[test]
fn only_changed_tables_are_rewritten() {
    let baseline = tempfile::tempdir().expect("tempdir");
    let report = export(baseline.path(), &NoHooks, Format::Lua);
    assert!(report.rewritten.is_empty());
    let a_before = fs::read(baseline.path().join("A.lua")).unwrap();
    let b_before = fs::read(baseline.path().join("B.lua")).unwrap();

    let hook_dir = tempfile::tempdir().expect("tempdir");
    let script = format!(
        "{RECORDING}\nfunction GetChangedData()\n    return {{ A = {{ r1 = {{ value = received.A.r2.value + 1 }} }} }}\nend\n"
    );
    let hooks = hooks_with_global(hook_dir.path(), &script);
    let out = tempfile::tempdir().expect("tempdir");
    let report = export(out.path(), &hooks, Format::Lua);
    assert_eq!(report.exported, ["A", "B"]);
    assert_eq!(report.rewritten, ["A"]);

    assert_eq!(fs::read(out.path().join("B.lua")).unwrap(), b_before);
    let a_after = fs::read_to_string(out.path().join("A.lua")).unwrap();
    assert_ne!(a_after.as_bytes(), a_before.as_slice());
    let rows: Vec<&str> = a_after.lines().filter(|line| line.starts_with('[')).collect();
    assert_eq!(
        rows,
        ["[\"r1\"]\t=\t{\"r1\", 21, 0.5, },", "[\"r2\"]\t=\t{\"r2\", 20, 1.5, },"]
    );
}

#[test]
fn empty_change_set_reproduces_primary_output() {
    for format in [Format::Lua, Format::Json] {
        let baseline = tempfile::tempdir().expect("tempdir");
        export(baseline.path(), &NoHooks, format);

        let hook_dir = tempfile::tempdir().expect("tempdir");
        let script = format!("{RECORDING}\nfunction GetChangedData() return {{ A = {{}} }} end\n");
        let hooks = hooks_with_global(hook_dir.path(), &script);
        let out = tempfile::tempdir().expect("tempdir");
        let report = export(out.path(), &hooks, format);
        assert_eq!(report.rewritten, ["A"]);

        for table in ["A", "B"] {
            let name = format!("{table}.{}", format.extension());
            assert_eq!(
                fs::read(out.path().join(&name)).unwrap(),
                fs::read(baseline.path().join(&name)).unwrap(),
                "{name}"
            );
        }
    }
}

#[test]
fn unknown_tables_rows_and_fields_are_ignored() {
    let hook_dir = tempfile::tempdir().expect("tempdir");
    let script = format!(
        "{RECORDING}\nfunction GetChangedData()\n    return {{ Nope = {{ x = {{}} }}, A = {{ ghost = {{ value = 1 }}, r2 = {{ bogus = 1 }} }} }}\nend\n"
    );
    let hooks = hooks_with_global(hook_dir.path(), &script);
    let out = tempfile::tempdir().expect("tempdir");
    let report = export(out.path(), &hooks, Format::Json);
    assert_eq!(report.rewritten, ["A"]);

    let a: serde_json::Value =
        serde_json::from_slice(&fs::read(out.path().join("A.json")).unwrap()).unwrap();
    assert_eq!(a["r2"]["value"], 20);
    assert!(a.get("ghost").is_none());
    assert!(a["r2"].get("bogus").is_none());
}

#[test]
fn script_errors_fail_the_run() {
    let hook_dir = tempfile::tempdir().expect("tempdir");
    let script = "function GlobalCacheDataList() return {\"A\"} end\n\
                  function ProcessCacheData() error(\"aggregate failed\") end\n";
    let hooks = hooks_with_global(hook_dir.path(), script);
    let out = tempfile::tempdir().expect("tempdir");
    let source = source();
    let err = Exporter::new(&source, &hooks, out.path(), Format::Lua)
        .run(&defs(), &[])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Engine);
    assert!(out.path().join("A.lua").is_file());
}

#[test]
fn map_tables_are_exported_and_rewritten_as_one_file() {
    let source = MemorySource::new().with_table(
        "Global",
        [
            vec!["skiprow", "settings"],
            vec!["MaxLevel", "60", "Int"],
            vec!["Title", "Hero", "Str"],
            vec!["Unused", "x", ""],
        ],
    );
    let defs = vec![TableDef::new("Global", "Global.xlsx").map_shaped().one_row_one_file()];
    let hook_dir = tempfile::tempdir().expect("tempdir");
    let hooks = hooks_with_global(
        hook_dir.path(),
        r#"
local global
function GlobalCacheDataList() return {"Global"} end
function ReceiveCacheData(name, data) global = data end
function GetChangedData()
    return { Global = { MaxLevel = global.MaxLevel + 1, Missing = 1 } }
end
"#,
    );
    let out = tempfile::tempdir().expect("tempdir");
    let report = Exporter::new(&source, &hooks, out.path(), Format::Json)
        .run(&defs, &[])
        .expect("export");
    assert_eq!(report.exported, ["Global"]);
    assert_eq!(report.rewritten, ["Global"]);

    assert!(!out.path().join("Global").exists());
    let global: serde_json::Value =
        serde_json::from_slice(&fs::read(out.path().join("Global.json")).unwrap()).unwrap();
    assert_eq!(global, serde_json::json!({"MaxLevel": 61, "Title": "Hero"}));
}

#[test]
fn per_row_tables_are_rewritten_row_by_row() {
    let source = source();
    let defs = vec![TableDef::new("A", "A.xlsx").one_row_one_file()];
    let hook_dir = tempfile::tempdir().expect("tempdir");
    let script = format!(
        "{RECORDING}\nfunction GetChangedData() return {{ A = {{ r2 = {{ rate = 9.5 }} }} }} end\n"
    );
    let hooks = hooks_with_global(hook_dir.path(), &script);
    let out = tempfile::tempdir().expect("tempdir");
    let report = Exporter::new(&source, &hooks, out.path(), Format::Json)
        .run(&defs, &[])
        .expect("export");
    assert_eq!(report.rewritten, ["A"]);

    let read = |name: &str| -> serde_json::Value {
        serde_json::from_slice(&fs::read(out.path().join("A").join(name)).unwrap()).unwrap()
    };
    assert_eq!(read("index.json"), serde_json::json!(["r1", "r2"]));
    assert_eq!(read("r1.json")["rate"], 0.5);
    assert_eq!(read("r2.json")["rate"], 9.5);
}
