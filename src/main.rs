// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Materializes container images from an object store as activatable
//! copy-on-write block devices.

use std::path::PathBuf;
use std::sync::Arc;

use getopts::Options;
use imageman::gc::run_gc;
use imageman::imageutil::{CommandRunner, SystemRunner};
use imageman::metadata::MetadataStore;
use imageman::thinpool::ThinPoolClient;
use imageman::{Config, ImageManager};
use log::error;
use tokio::signal::unix::{signal, SignalKind};

const EXIT_OK: i32 = 0;
const EXIT_TRANSIENT: i32 = 1;
const EXIT_PERMANENT: i32 = 2;

fn print_usage(message: &str, error: bool) {
    if error {
        eprintln!("{}", message)
    } else {
        println!("{}", message);
    }
}

fn init_logging() -> std::result::Result<(), ()> {
    if let Err(e) = stderrlog::new()
        .verbosity(3)
        .timestamp(stderrlog::Timestamp::Second)
        .init()
    {
        eprintln!("failed to initialize logging: {}", e);
        return Err(());
    }
    Ok(())
}

fn config_options(opts: &mut Options) {
    opts.optopt("c", "config", "Path to the JSON configuration file", "PATH");
    opts.optflag("h", "help", "Print this help text");
}

fn load_config(matches: &getopts::Matches) -> Result<Config, i32> {
    let path = matches.opt_str("c").map(PathBuf::from);
    Config::load(path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {:#}", e);
        EXIT_PERMANENT
    })
}

/// Map a manager construction failure onto an exit code. A held guard is
/// not going to resolve by itself.
fn setup_exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<imageman::ImageError>() {
        Some(image_err) if image_err.is_permanent() => EXIT_PERMANENT,
        _ => EXIT_TRANSIENT,
    }
}

async fn build_manager(config: Config) -> Result<ImageManager, i32> {
    let manager = ImageManager::new(config).await.map_err(|e| {
        error!("Failed to start manager: {:#}", e);
        setup_exit_code(&e)
    })?;

    // SIGTERM cancels in-flight work; the runs stay resumable.
    let cancel = manager.cancel_token();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::spawn(async move {
                term.recv().await;
                cancel.cancel();
            });
        }
        Err(e) => error!("Failed to install SIGTERM handler: {}", e),
    }
    Ok(manager)
}

fn process_usage(error: bool, options: &Options) {
    let brief = r#"Usage: imageman process [options] <object-key>
Download, unpack, and activate the image stored under the given object
key. Prints the activatable snapshot device on success.
"#;
    print_usage(&options.usage(brief), error);
}

async fn imageman_process(args: &mut std::env::Args) -> i32 {
    let mut opts = Options::new();
    config_options(&mut opts);
    let args: Vec<String> = args.collect();
    let matches = match opts.parse(args) {
        Ok(matches) => matches,
        Err(e) => {
            eprintln!("Failed to parse arguments: {}", e);
            process_usage(true, &opts);
            return EXIT_PERMANENT;
        }
    };
    if matches.opt_present("h") {
        process_usage(false, &opts);
        return EXIT_OK;
    }
    let object_key = match matches.free.first() {
        Some(object_key) => object_key.clone(),
        None => {
            process_usage(true, &opts);
            return EXIT_PERMANENT;
        }
    };
    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let manager = match build_manager(config).await {
        Ok(manager) => manager,
        Err(code) => return code,
    };
    if let Err(e) = manager.resume_pending().await {
        error!("Failed to resume pending runs: {:#}", e);
    }

    match manager.process_image(&object_key).await {
        Ok(outcome) => {
            println!("{}", outcome.device_path);
            EXIT_OK
        }
        Err(e) => {
            error!("Failed to process {}: {}", object_key, e);
            e.exit_code()
        }
    }
}

fn listing_usage(command: &str, error: bool, options: &Options) {
    let brief = format!(
        "Usage: imageman {} [options]\nPrint the known rows from the metadata store.\n",
        command
    );
    print_usage(&options.usage(&brief), error);
}

async fn imageman_list(args: &mut std::env::Args, snapshots: bool) -> i32 {
    let command = if snapshots { "list-snapshots" } else { "list-images" };
    let mut opts = Options::new();
    config_options(&mut opts);
    let args: Vec<String> = args.collect();
    let matches = match opts.parse(args) {
        Ok(matches) => matches,
        Err(e) => {
            eprintln!("Failed to parse arguments: {}", e);
            listing_usage(command, true, &opts);
            return EXIT_PERMANENT;
        }
    };
    if matches.opt_present("h") {
        listing_usage(command, false, &opts);
        return EXIT_OK;
    }
    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let store = match MetadataStore::open(&config.images_db_path()) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open metadata store: {:#}", e);
            return EXIT_TRANSIENT;
        }
    };
    let result = if snapshots {
        store.list_snapshots().map(|rows| {
            for row in rows {
                println!(
                    "{}\t{}\t{}\torigin={}\tactive={}",
                    row.snapshot_name, row.image_id, row.device_path, row.origin_device_id,
                    row.active
                );
            }
        })
    } else {
        store.list_images().map(|rows| {
            for row in rows {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    row.object_key,
                    row.image_id,
                    row.download_status,
                    row.activation_status,
                    row.size_bytes.unwrap_or(0)
                );
            }
        })
    };
    match result {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!("Failed to list: {:#}", e);
            EXIT_TRANSIENT
        }
    }
}

fn status_usage(error: bool, options: &Options) {
    let brief = r#"Usage: imageman status [options] <run-id>
Print the persisted state of a machine run, e.g. download:img_abc.
"#;
    print_usage(&options.usage(brief), error);
}

async fn imageman_status(args: &mut std::env::Args) -> i32 {
    let mut opts = Options::new();
    config_options(&mut opts);
    let args: Vec<String> = args.collect();
    let matches = match opts.parse(args) {
        Ok(matches) => matches,
        Err(e) => {
            eprintln!("Failed to parse arguments: {}", e);
            status_usage(true, &opts);
            return EXIT_PERMANENT;
        }
    };
    if matches.opt_present("h") {
        status_usage(false, &opts);
        return EXIT_OK;
    }
    let run_id = match matches.free.first() {
        Some(run_id) => run_id.clone(),
        None => {
            status_usage(true, &opts);
            return EXIT_PERMANENT;
        }
    };
    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let log = match imageman::machine::EventLog::open(&config.fsm_db_path()) {
        Ok(log) => log,
        Err(e) => {
            error!("Failed to open event log: {:#}", e);
            return EXIT_TRANSIENT;
        }
    };
    match log.run_status(&run_id) {
        Ok(Some(status)) => {
            println!("run: {}", status.run_id);
            println!("machine: {}", status.machine);
            println!("status: {}", status.status);
            println!("updated: {}", status.updated_at);
            if let Some(transition) = status.last_transition {
                println!(
                    "last transition: {} ({})",
                    transition,
                    status.last_outcome.as_deref().unwrap_or("none")
                );
            }
            if let Some(last_error) = status.last_error {
                println!("last error: {}", last_error);
            }
            EXIT_OK
        }
        Ok(None) => {
            eprintln!("No run named {}", run_id);
            EXIT_PERMANENT
        }
        Err(e) => {
            error!("Failed to read run status: {:#}", e);
            EXIT_TRANSIENT
        }
    }
}

fn gc_usage(error: bool, options: &Options) {
    let brief = r#"Usage: imageman gc [options]
Reclaim orphaned devices, stale locks, and partial downloads. Refuses to
run while a manager is active unless forced.
"#;
    print_usage(&options.usage(brief), error);
}

async fn imageman_gc(args: &mut std::env::Args) -> i32 {
    let mut opts = Options::new();
    config_options(&mut opts);
    opts.optflag("f", "force", "Collect even while a manager is running");
    let args: Vec<String> = args.collect();
    let matches = match opts.parse(args) {
        Ok(matches) => matches,
        Err(e) => {
            eprintln!("Failed to parse arguments: {}", e);
            gc_usage(true, &opts);
            return EXIT_PERMANENT;
        }
    };
    if matches.opt_present("h") {
        gc_usage(false, &opts);
        return EXIT_OK;
    }
    let force = matches.opt_present("f");
    let config = match load_config(&matches) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let store = match MetadataStore::open(&config.images_db_path()) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open metadata store: {:#}", e);
            return EXIT_TRANSIENT;
        }
    };
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner {});
    let pool = ThinPoolClient::new(&config.pool_name, config.pool_block_sectors, runner);
    match run_gc(&config, &store, &pool, force).await {
        Ok(report) => {
            println!(
                "removed {} devices, {} pool IDs, {} stale snapshots, {} locks, \
                 {} stale reservations, {} partial downloads",
                report.devices_removed,
                report.pool_ids_deleted,
                report.snapshots_deactivated,
                report.locks_cleared,
                report.reservations_expired,
                report.partials_removed
            );
            EXIT_OK
        }
        Err(e) => {
            error!("Garbage collection failed: {:#}", e);
            EXIT_PERMANENT
        }
    }
}

fn app_usage(error: bool) {
    let usage_msg = r#"Usage: imageman subcommand [options]
This application materializes container images from an object store as
activatable copy-on-write block devices. Try
imageman <subcommand> --help for details on specific subcommands.

Valid subcommands are:
    help -- Print this help text.
    process -- Download, unpack, and activate an image.
    list-images -- Print the known images.
    list-snapshots -- Print the known snapshots.
    status -- Print the state of a machine run.
    gc -- Reclaim orphans left by failed operations.
"#;
    print_usage(usage_msg, error);
}

async fn imageman_main() -> i32 {
    let mut args = std::env::args();
    if args.next().is_none() {
        eprintln!("expected executable name.");
        return EXIT_PERMANENT;
    }

    let subcommand = match args.next() {
        Some(subcommand) => subcommand,
        None => {
            app_usage(true);
            return EXIT_PERMANENT;
        }
    };

    if matches!(subcommand.as_str(), "--help" | "-h" | "help") {
        app_usage(false);
        return EXIT_OK;
    }
    if init_logging().is_err() {
        return EXIT_TRANSIENT;
    }

    match subcommand.as_ref() {
        "process" => imageman_process(&mut args).await,
        "list-images" => imageman_list(&mut args, false).await,
        "list-snapshots" => imageman_list(&mut args, true).await,
        "status" => imageman_status(&mut args).await,
        "gc" => imageman_gc(&mut args).await,
        _ => {
            eprintln!("unknown subcommand: {}", subcommand);
            app_usage(true);
            EXIT_PERMANENT
        }
    }
}

fn main() {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(EXIT_TRANSIENT);
        }
    };
    std::process::exit(runtime.block_on(imageman_main()));
}
