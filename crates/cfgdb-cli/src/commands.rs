use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use tracing::debug;

use cfgdb_audit::{Action, Auditor, OperationReport, RunMode};
use cfgdb_store::{CellStore, StoreBackend, StoreConfig, StoreDump};
use cfgdb_types::SchemaRegistry;

use crate::cli::*;
use crate::config::ManageConfig;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Command::Check(args) => cmd_run(&cli, Action::Check, args.name.as_deref()),
        Command::Clean(args) => cmd_run(&cli, Action::Clean, args.name.as_deref()),
        Command::Heal(args) => cmd_run(&cli, Action::Heal, args.name.as_deref()),
        Command::List => cmd_list(&cli.format),
    }
}

/// File settings with command-line overrides applied.
fn load_config(cli: &Cli) -> anyhow::Result<ManageConfig> {
    let mut config = match &cli.config {
        Some(path) => ManageConfig::load(path)?,
        None => ManageConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.store.backend = StoreBackend::Durable { path: dir.clone() };
    }
    if let Some(creds) = StoreConfig::credentials_from(cli.username.clone(), cli.password.clone())? {
        config.store.credentials = Some(creds);
    }
    Ok(config)
}

fn open_store(cli: &Cli, config: &StoreConfig) -> anyhow::Result<Arc<dyn CellStore>> {
    match &cli.in_json {
        Some(path) => {
            config.validate()?;
            let dump = StoreDump::read_from(path).with_context(|| format!("loading dump {}", path.display()))?;
            Ok(config.wrap(dump.into_store()?))
        }
        None => Ok(config.open()?),
    }
}

fn cmd_run(cli: &Cli, action: Action, name: Option<&str>) -> anyhow::Result<()> {
    // repairs to an in-memory dump only survive through --out-json
    if cli.execute && action != Action::Check && cli.in_json.is_some() && cli.out_json.is_none() {
        anyhow::bail!("--execute {action} against --in-json needs --out-json to keep the repairs");
    }
    let config = load_config(cli)?;
    let store = open_store(cli, &config.store)?;
    let mode = if cli.execute { RunMode::Execute } else { RunMode::DryRun };
    debug!(?mode, %action, "starting audit");

    let auditor = Auditor::new(
        store.clone(),
        store.clone(),
        Arc::new(SchemaRegistry::builtin()),
        config.audit,
        mode,
    )?;
    let reports = match name {
        Some(name) => vec![auditor.run(action, name)?],
        None => auditor.run_all(action)?,
    };

    match cli.format {
        OutputFormat::Text => print_reports(&reports),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
    }

    if let Some(path) = &cli.out_json {
        StoreDump::capture(store.as_ref())?
            .write_to(path)
            .with_context(|| format!("writing dump {}", path.display()))?;
    }
    Ok(())
}

fn print_reports(reports: &[OperationReport]) {
    for report in reports {
        let status = if report.success() { "✓".green().bold() } else { "✗".red().bold() };
        let outcome = match (report.action, report.dry_run) {
            (Action::Check, _) if report.success() => "Success".green().to_string(),
            (Action::Check, _) => format!("{} ({} findings)", "Failed".red(), report.findings.len()),
            (_, true) => format!("dry run, {} findings", report.findings.len()),
            (_, false) => format!("{} repairs for {} findings", report.applied, report.findings.len()),
        };
        println!("{status} {}: {outcome}", report.name.bold());
        for finding in &report.findings {
            println!("    {}", finding.to_string().dimmed());
        }
    }
    let failed = reports.iter().filter(|r| !r.success()).count();
    if failed == 0 {
        println!("\n{} {} operations", "✓".green().bold(), reports.len());
    } else {
        println!("\n{} {failed} of {} operations found inconsistencies", "✗".red().bold(), reports.len());
    }
}

fn cmd_list(format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => {
            for op in Auditor::operations() {
                println!("{:<32} {}", op.name.bold(), op.summary);
            }
        }
        OutputFormat::Json => {
            let ops: Vec<serde_json::Value> = Auditor::operations()
                .iter()
                .map(|op| serde_json::json!({ "name": op.name, "action": op.action, "summary": op.summary }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&ops)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    use cfgdb_audit::FindingKind;
    use cfgdb_graph::columns::{index_col, FQ_TABLE};
    use cfgdb_graph::{NewObject, ObjectGraphStore};
    use cfgdb_store::{InMemoryCellStore, WriteBatch};
    use cfgdb_types::FqName;

    fn make_dump(path: &std::path::Path) {
        let store: Arc<dyn CellStore> = Arc::new(InMemoryCellStore::new());
        let graph = ObjectGraphStore::new(store.clone(), Arc::new(SchemaRegistry::builtin()));
        let name = FqName::new(["d1"]).unwrap();
        let id = graph.create(NewObject::new("domain", name.clone())).unwrap();
        let mut batch = WriteBatch::new();
        batch.delete_cell(FQ_TABLE, "domain", index_col(&name, &id));
        store.apply(batch).unwrap();
        StoreDump::capture(store.as_ref()).unwrap().write_to(path).unwrap();
    }

    fn missing_index_count(path: &std::path::Path) -> usize {
        let store: Arc<dyn CellStore> = Arc::new(StoreDump::read_from(path).unwrap().into_store().unwrap());
        let auditor = Auditor::new(
            store.clone(),
            store,
            Arc::new(SchemaRegistry::builtin()),
            Default::default(),
            RunMode::DryRun,
        )
        .unwrap();
        auditor.run(Action::Check, "check_fq_name_index").unwrap().count(FindingKind::MissingIndex)
    }

    fn run(args: &[&str]) -> anyhow::Result<()> {
        run_command(Cli::try_parse_from(args)?)
    }

    #[test]
    fn heal_against_dump_writes_repaired_state() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.json");
        let output = dir.path().join("out.json");
        make_dump(&input);
        assert_eq!(missing_index_count(&input), 1);

        let (i, o) = (input.to_str().unwrap(), output.to_str().unwrap());
        run(&["cfgdb-manage", "--in-json", i, "--out-json", o, "--execute", "heal", "heal_fq_name_index"]).unwrap();
        assert_eq!(missing_index_count(&output), 0);
    }

    #[test]
    fn dry_run_leaves_dump_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.json");
        let output = dir.path().join("out.json");
        make_dump(&input);

        let (i, o) = (input.to_str().unwrap(), output.to_str().unwrap());
        run(&["cfgdb-manage", "--in-json", i, "--out-json", o, "heal"]).unwrap();
        assert_eq!(missing_index_count(&output), 1);
    }

    #[test]
    fn executed_repairs_on_dump_need_an_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.json");
        make_dump(&input);
        let i = input.to_str().unwrap();

        let err = run(&["cfgdb-manage", "--in-json", i, "--execute", "heal"]).unwrap_err();
        assert!(err.to_string().contains("--out-json"), "{err}");
        assert_eq!(missing_index_count(&input), 1);

        run(&["cfgdb-manage", "--in-json", i, "--execute", "check"]).unwrap();
        run(&["cfgdb-manage", "--in-json", i, "heal"]).unwrap();
    }

    #[test]
    fn unknown_operation_fails() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.json");
        make_dump(&input);
        let i = input.to_str().unwrap();
        assert!(run(&["cfgdb-manage", "--in-json", i, "check", "check_nothing"]).is_err());
    }

    #[test]
    fn durable_store_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().to_str().unwrap();
        run(&["cfgdb-manage", "--data-dir", data, "--format", "json", "check"]).unwrap();
        run(&["cfgdb-manage", "--data-dir", data, "--execute", "heal"]).unwrap();
    }

    #[test]
    fn list_prints_registry() {
        run(&["cfgdb-manage", "list"]).unwrap();
        run(&["cfgdb-manage", "--format", "json", "list"]).unwrap();
    }
}
