// CLI integration tests: config loading, workbook export, error envelopes.
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use rust_xlsxwriter::Workbook;
use serde_json::Value;

fn cmd(cwd: &Path) -> Command {
    let exe = env!("CARGO_BIN_EXE_sheetport");
    let mut command = Command::new(exe);
    command.current_dir(cwd).env("RUST_LOG", "warn");
    command
}

fn parse_json(output: &[u8]) -> Value {
    let text = std::str::from_utf8(output).expect("utf8");
    serde_json::from_str(text.trim()).expect("valid json")
}

fn write_sheet(path: &Path, sheet: &str, rows: &[&[&str]]) {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(sheet).expect("sheet name");
    for (r, row) in rows.iter().enumerate() {
        for (c, cell) in row.iter().enumerate() {
            if !cell.is_empty() {
                worksheet
                    .write_string(r as u32, c as u16, *cell)
                    .expect("write cell");
            }
        }
    }
    workbook.save(path).expect("save workbook");
}

fn write_conf(dir: &Path, defs: &str) {
    let conf = format!(r#"{{"src_dir": "tables", "out_dir": "out", "data_def": [{defs}]}}"#);
    fs::write(dir.join("conf.json"), conf).expect("write conf");
}

fn item_project() -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::create_dir(temp.path().join("tables")).expect("tables dir");
    write_sheet(
        &temp.path().join("tables/Item.xlsx"),
        "Item",
        &[
            &["skiprow", "item table"],
            &["Int", "Str", "Int=1", "Bool=1", "List(Int)"],
            &["", "", "", "", ""],
            &["id", "name", "count", "ExportTable", "drops"],
            &["1", "sword", "12", "", "3,4"],
            &["2", "hidden", "", "0", ""],
            &["", "no id", "", "", ""],
            &["3", "shield", "", "1", "[5]"],
        ],
    );
    write_conf(
        temp.path(),
        r#"{"name": "Item", "excel": "Item.xlsx", "sheet": "Item"}"#,
    );
    temp
}

fn run(cwd: &Path, args: &[&str]) -> Output {
    cmd(cwd).args(args).output().expect("run sheetport")
}

#[test]
fn export_writes_lua_tables_and_reports() {
    let temp = item_project();
    let output = run(temp.path(), &["export"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let report = parse_json(&output.stdout);
    assert_eq!(report["exported"], serde_json::json!(["Item"]));
    assert_eq!(report["skipped"], serde_json::json!([]));
    assert_eq!(report["rewritten"], serde_json::json!([]));

    let lua = fs::read_to_string(temp.path().join("out/Item.lua")).expect("Item.lua");
    assert!(lua.starts_with("local key = {id=1, name=2, count=3, drops=4, }\n"));
    assert!(lua.contains("[1]\t=\t{1, \"sword\", 12, {3, 4, }, },\n"));
    assert!(lua.contains("[3]\t=\t{3, \"shield\", 1, {5, }, },\n"));
    assert!(!lua.contains("hidden"));
    assert!(!lua.contains("no id"));
    assert!(lua.ends_with("return _M"));
}

#[test]
fn json_format_and_one_row_one_file() {
    let temp = item_project();
    write_conf(
        temp.path(),
        r#"{"name": "Item", "excel": "Item.xlsx", "one_row_one_file": true},
           {"name": "Shop", "excel": "Shop.xlsx"}"#,
    );
    let output = run(temp.path(), &["export", "--format", "json", "--cpu", "2"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report = parse_json(&output.stdout);
    assert_eq!(report["exported"], serde_json::json!(["Item"]));
    assert_eq!(report["skipped"], serde_json::json!(["Shop"]));

    let index = parse_json(&fs::read(temp.path().join("out/Item/index.json")).unwrap());
    assert_eq!(index, serde_json::json!([1, 3]));
    let row = parse_json(&fs::read(temp.path().join("out/Item/3.json")).unwrap());
    assert_eq!(
        row,
        serde_json::json!({"id": 3, "name": "shield", "count": 1, "drops": [5]})
    );
    assert!(!temp.path().join("out/Item.json").exists());
}

#[test]
fn legacy_single_dash_flags_select_tables() {
    let temp = item_project();
    fs::rename(temp.path().join("conf.json"), temp.path().join("build.json")).unwrap();
    let output = run(temp.path(), &["export", "-conf", "build.json", "-name", "Other"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report = parse_json(&output.stdout);
    assert_eq!(report["exported"], serde_json::json!([]));
    assert!(!temp.path().join("out/Item.lua").exists());
}

#[test]
fn conversion_errors_exit_with_cell_context() {
    let temp = item_project();
    write_sheet(
        &temp.path().join("tables/Item.xlsx"),
        "Item",
        &[&["Int", "Int"], &[], &["id", "hp"], &["1", "lots"]],
    );
    let output = run(temp.path(), &["export"]);
    assert_eq!(output.status.code(), Some(7));
    let err = parse_json(&output.stderr.rsplit(|b| *b == b'\n').find(|l| !l.is_empty()).unwrap());
    assert_eq!(err["error"]["kind"], "Conversion");
    assert_eq!(err["error"]["table"], "Item");
    assert_eq!(err["error"]["row"], 4);
    assert_eq!(err["error"]["column"], "hp");
}

#[test]
fn grammar_errors_are_fatal() {
    let temp = item_project();
    write_sheet(
        &temp.path().join("tables/Item.xlsx"),
        "Item",
        &[&["Int", "List(Int"], &[], &["id", "xs"], &["1", "2"]],
    );
    let output = run(temp.path(), &["export"]);
    assert_eq!(output.status.code(), Some(6));
    assert!(!temp.path().join("out/Item.lua").exists());
}

#[test]
fn missing_config_is_a_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = run(temp.path(), &["export"]);
    assert_eq!(output.status.code(), Some(3));
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "Config");
    assert!(err["error"]["hint"].as_str().unwrap().contains("conf.json"));
}

#[test]
fn lua_hooks_and_global_script_rewrite_tables() {
    let temp = item_project();
    fs::create_dir(temp.path().join("hook")).unwrap();
    fs::write(
        temp.path().join("hook/Item.lua"),
        "function Item_name(s) return string.upper(s) end\n",
    )
    .unwrap();
    fs::write(
        temp.path().join("hook/GlobalProcess.lua"),
        r#"
local items
function GlobalCacheDataList() return {"Item"} end
function ReceiveCacheData(name, data) items = data end
function ProcessCacheData() end
function GetChangedData()
    return { Item = { [3] = { count = items[3].count + items[1].count } } }
end
"#,
    )
    .unwrap();

    let output = run(temp.path(), &["export"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report = parse_json(&output.stdout);
    assert_eq!(report["rewritten"], serde_json::json!(["Item"]));

    let lua = fs::read_to_string(temp.path().join("out/Item.lua")).unwrap();
    assert!(lua.contains("[1]\t=\t{1, \"SWORD\", 12, {3, 4, }, },\n"));
    assert!(lua.contains("[3]\t=\t{3, \"SHIELD\", 13, {5, }, },\n"));
}

#[test]
fn types_prints_descriptors() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = run(temp.path(), &["types", "Int=3", "List( Int )"]);
    assert!(output.status.success());
    let value = parse_json(&output.stdout);
    assert_eq!(value[0]["canonical"], "Int=3");
    assert_eq!(value[1]["canonical"], "List(Int)");
    assert_eq!(value[1]["decl"]["type"], "List");

    let output = run(temp.path(), &["types", "Lst(Int)"]);
    assert_eq!(output.status.code(), Some(6));
}

#[test]
fn completion_generates_script() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = run(temp.path(), &["completion", "bash"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("sheetport"));
}
