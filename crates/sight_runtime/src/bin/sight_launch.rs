//! Sight Launch CLI
//!
//! Usage:
//!   sight_launch app.yaml
//!   sight_launch app.yaml -c viewer -p image:=series_1
//!   sight_launch app.yaml --list
//!   sight_launch app.yaml -c viewer --dry-run

use sight_runtime::{
    AppConfigFile, AppGraph, ConfigLauncher, ConfigValue, FieldAdaptor, LaunchArgs,
    LauncherConfig, Runtime, RuntimeConfig,
};
use std::collections::BTreeMap;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let args: LaunchArgs = argh::from_env();

    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    log::info!("Loading configuration file: {}", args.config_file);
    let file = match AppConfigFile::from_file(&args.config_file) {
        Ok(file) => file,
        Err(e) => {
            log::error!("Failed to load configuration file: {}", e);
            std::process::exit(1);
        }
    };
    let version = file.version.clone();

    let runtime = Runtime::new(RuntimeConfig::default());
    let ids = match runtime.configs().load(file) {
        Ok(ids) => ids,
        Err(e) => {
            log::error!("Failed to register configurations: {}", e);
            std::process::exit(1);
        }
    };
    let fields = args.fields();

    if args.list {
        list(&runtime, &ids, args.json);
        return;
    }

    if args.validate {
        let failures = validate(&runtime, &ids, &fields);
        if failures > 0 {
            log::error!("{} configuration(s) failed validation", failures);
            std::process::exit(1);
        }
        println!("Configuration file '{}' is valid", args.config_file);
        println!("  Version: {}", version);
        println!("  Configurations: {}", ids.len());
        return;
    }

    let config_id = match args.config.clone().or_else(|| ids.first().cloned()) {
        Some(id) => id,
        None => {
            log::error!("No configuration in '{}'", args.config_file);
            std::process::exit(1);
        }
    };

    if args.dry_run {
        if let Err(e) = dry_run(&runtime, &config_id, &fields, !args.no_prefix, args.json) {
            log::error!("Failed to adapt configuration '{}': {}", config_id, e);
            std::process::exit(1);
        }
        return;
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(());
    {
        let shutdown_tx = shutdown_tx.clone();
        let handler = ctrlc::set_handler(move || {
            log::info!("Received Ctrl+C, initiating shutdown...");
            let _ = shutdown_tx.send(());
        });
        if let Err(e) = handler {
            log::error!("Error setting Ctrl+C handler: {}", e);
            std::process::exit(1);
        }
    }

    let launcher = ConfigLauncher::new(
        runtime.clone(),
        LauncherConfig {
            auto_prefix: !args.no_prefix,
            fields,
            ..Default::default()
        },
    );

    let launched = match launcher.set_config(&config_id).await {
        Ok(()) => launcher.update().await,
        Err(e) => Err(e),
    };
    if let Err(e) = launched {
        log::error!("Launch failed: {}", e);
        runtime.shutdown().await;
        std::process::exit(1);
    }

    log::info!("Running '{}', press Ctrl+C to stop", config_id);
    let _ = shutdown_rx.changed().await;

    launcher.stop().await;
    runtime.shutdown().await;
    log::info!("Sight launcher exiting");
}

fn list(runtime: &Runtime, ids: &[String], json: bool) {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for id in ids {
        let group = runtime
            .configs()
            .template(id)
            .map(|t| t.group.clone())
            .unwrap_or_default();
        groups.entry(group).or_default().push(id.clone());
    }

    if json {
        match serde_json::to_string_pretty(&groups) {
            Ok(out) => println!("{}", out),
            Err(e) => log::error!("Failed to serialize configuration list: {}", e),
        }
        return;
    }

    for (group, ids) in &groups {
        let name = if group.is_empty() { "(no group)" } else { group };
        println!("{}:", name);
        for id in ids {
            let description = runtime
                .configs()
                .template(id)
                .map(|t| t.description.clone())
                .unwrap_or_default();
            if description.is_empty() {
                println!("  {}", id);
            } else {
                println!("  {} - {}", id, description);
            }
        }
    }
}

/// Adapt and check every configuration, standing in for parameters not supplied
fn validate(runtime: &Runtime, ids: &[String], fields: &FieldAdaptor) -> usize {
    let mut failures = 0;
    for id in ids {
        let mut fields = fields.clone();
        for name in runtime.configs().required_fields(id).unwrap_or_default() {
            fields
                .entry(name.clone())
                .or_insert_with(|| ConfigValue::String(format!("<{}>", name)));
        }

        let result = runtime
            .configs()
            .get_adapted_config(id, &fields, true)
            .map_err(|e| e.to_string())
            .and_then(|adapted| AppGraph::from_adapted(&adapted).map_err(|e| e.to_string()));

        match result {
            Ok(graph) => println!(
                "  {}: ok ({} object(s), {} service(s))",
                id,
                graph.objects.len(),
                graph.services.len()
            ),
            Err(e) => {
                println!("  {}: {}", id, e);
                failures += 1;
            }
        }
    }
    failures
}

fn dry_run(
    runtime: &Runtime,
    config_id: &str,
    fields: &FieldAdaptor,
    auto_prefix: bool,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let adapted = runtime
        .configs()
        .get_adapted_config(config_id, fields, auto_prefix)?;
    let graph = AppGraph::from_adapted(&adapted)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&adapted.tree)?);
        return Ok(());
    }

    println!("Application Plan: {}", config_id);
    println!("==================");
    if let Some(instance) = &adapted.instance_id {
        println!("Instance: {}", instance);
    }
    println!();
    print!("{}", graph);
    println!();
    println!("Adapted configuration:");
    print!("{}", serde_yaml::to_string(&adapted.tree)?);
    Ok(())
}
