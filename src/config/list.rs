use anyhow::Result;
use serde_json::{json, Map, Value};

use crate::args::BaseArgs;
use crate::ui::{apply_column_padding, header, styled_table};

use super::Config;

pub fn run(base: BaseArgs, global: bool, local: bool, by_source: bool) -> Result<()> {
    if by_source {
        run_by_source(base, global, local)
    } else {
        run_resolved(base, global, local)
    }
}

fn run_resolved(base: BaseArgs, global: bool, local: bool) -> Result<()> {
    let config = super::load_scoped(global, local)?;
    let output = format_resolved(&config, base.json)?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

/// Table names to show: built-ins plus anything configured.
fn table_names(config: &Config) -> Vec<String> {
    let mut names: Vec<String> = vec!["chats".into(), "tickets".into()];
    for name in config.tables.keys() {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    names.sort();
    names
}

fn format_resolved(config: &Config, json: bool) -> Result<String> {
    let fields = config.non_empty_fields();
    let specs: Vec<_> = table_names(config)
        .iter()
        .map(|name| config.resolve_table(name))
        .collect();

    if json {
        let mut map: Map<String, Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        let tables: Map<String, Value> = specs
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    json!({
                        "tab": spec.tab,
                        "kind": spec.kind.as_str(),
                        "key_column": spec.key_column,
                        "timestamp_column": spec.timestamp_column,
                    }),
                )
            })
            .collect();
        map.insert("tables".into(), Value::Object(tables));
        return Ok(serde_json::to_string(&map)?);
    }

    let mut out = fields
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("\n");

    let mut table = styled_table();
    table.set_header(vec![
        header("Table"),
        header("Tab"),
        header("Kind"),
        header("Key"),
        header("Timestamp"),
    ]);
    apply_column_padding(&mut table, (0, 3));
    for spec in &specs {
        table.add_row(vec![
            spec.name.clone(),
            spec.tab.clone(),
            spec.kind.to_string(),
            spec.key_column.clone().unwrap_or_else(|| "(detect)".into()),
            spec.timestamp_column.clone(),
        ]);
    }
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(&table.to_string());
    Ok(out)
}

fn run_by_source(base: BaseArgs, global: bool, local: bool) -> Result<()> {
    let global_path = super::global_path().ok();
    let local_path = super::local_path();

    let global_cfg = if !local {
        global_path
            .as_ref()
            .map(|p| (p.display().to_string(), super::load_file(p)))
    } else {
        None
    };

    let local_cfg = if !global {
        local_path.as_ref().map(|p| {
            let display_path = std::env::current_dir()
                .ok()
                .and_then(|cwd| pathdiff::diff_paths(p, &cwd))
                .unwrap_or_else(|| p.clone())
                .display()
                .to_string();
            (display_path, super::load_file(p))
        })
    } else {
        None
    };

    let mut sources: Vec<(String, Vec<(&str, &str)>)> = Vec::new();
    for (path, cfg) in [&global_cfg, &local_cfg].into_iter().flatten() {
        let fields = cfg.non_empty_fields();
        if !fields.is_empty() {
            sources.push((path.clone(), fields));
        }
    }

    let output = format_by_source(&sources, base.json)?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}

fn format_by_source(sources: &[(String, Vec<(&str, &str)>)], json: bool) -> Result<String> {
    if json {
        let mut map = Map::new();
        for (path, fields) in sources {
            let o: Map<String, Value> = fields
                .iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect();
            map.insert(path.clone(), Value::Object(o));
        }
        Ok(serde_json::to_string(&map)?)
    } else {
        let mut parts = Vec::new();
        for (path, fields) in sources {
            let mut group = String::from(path.as_str());
            for (key, value) in fields {
                group.push_str(&format!("\n  {key}: {value}"));
            }
            parts.push(group);
        }
        Ok(parts.join("\n\n"))
    }
}
