use std::{
    env, fs,
    path::{Path, PathBuf},
    process,
    sync::{Arc, mpsc},
    thread,
};

use tracing::{error, info, warn};

use lutrainit::{
    cli::{Commands, parse_args},
    config::{self, MainConfig},
    constants::{
        CONTROL_SOCKET_PATH, FALLBACK_PATH, LUTRA_BUILD_COMMIT,
        LUTRA_BUILD_TIME, LUTRA_VERSION, NET_FS, REEXEC_GETTYS_PATH,
        REEXEC_SERVICES_PATH,
    },
    control::{ControlServer, PowerEvent},
    deps,
    getty::{self, GettyPool},
    logging, mount, reaper, reexec,
    service::ServiceTable,
    shutdown, stats,
    supervisor::Supervisor,
};

fn main() {
    let args = parse_args();
    stats::mark_start();
    logging::init();

    let base_dir = PathBuf::from(&args.confdir);
    match args.command.unwrap_or(Commands::Sysinit) {
        Commands::Sysinit => sysinit(&base_dir),
        Commands::ServicesList => services_list(&base_dir),
        Commands::ServicesTree => services_tree(&base_dir),
    }
}

/// The PID 1 path: boot userspace, serve control requests, supervise
/// gettys, and finally halt the machine when they are gone.
fn sysinit(base_dir: &Path) {
    let resumed = reexec::resuming();
    if resumed {
        info!("re-exec of lutrainit in progress");
    }

    info!("~~ LutraInit {LUTRA_VERSION} starting...");
    info!("~~ Build commit {LUTRA_BUILD_COMMIT}");
    info!("~~ Build time {LUTRA_BUILD_TIME}");

    if process::id() != 1 {
        warn!("I'm sorry but I'm supposed to be run as an init.");
        process::exit(1);
    }

    // An initramfs leaves PATH unset, which breaks every shell-out below.
    let path_is_empty = env::var("PATH")
        .map(|value| value.trim().is_empty())
        .unwrap_or(true);
    if path_is_empty {
        unsafe { env::set_var("PATH", FALLBACK_PATH) };
        info!("empty $PATH, fixed");
    }

    let table = Arc::new(ServiceTable::new());
    let pool = Arc::new(GettyPool::new());

    // Resume state from the previous image, or fall back to a cold boot if
    // the snapshot cannot be trusted.
    let resumed = resumed
        && match reexec::read_snapshot(
            Path::new(REEXEC_SERVICES_PATH),
            Path::new(REEXEC_GETTYS_PATH),
        ) {
            Ok((services, gettys)) => {
                let restored = table
                    .restore(services)
                    .and_then(|()| pool.restore(gettys));
                match restored {
                    Ok(()) => true,
                    Err(err) => {
                        error!(
                            "cannot install re-exec snapshot, cold booting: {err}"
                        );
                        false
                    }
                }
            }
            Err(err) => {
                error!("cannot read re-exec snapshot, cold booting: {err}");
                false
            }
        };

    if !resumed {
        info!("remounting root filesystem");
        mount::remount("/");
        mount::swapon_all();
        set_hostname();
        // /dev/shm is neither automounted nor in fstab on common setups,
        // and plenty of software will not start without it.
        mount::mount("tmpfs", "shm", "/dev/shm", "mode=1777,nosuid,nodev");
        mount::mount_all_except(&NET_FS);
    }

    let main_config = match MainConfig::load(base_dir) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to parse main configuration: {err}");
            MainConfig::default()
        }
    };

    let supervisor = Supervisor::new(Arc::clone(&table));
    let (events_tx, events_rx) = mpsc::channel::<PowerEvent>();

    match ControlServer::bind(
        Path::new(CONTROL_SOCKET_PATH),
        supervisor.clone(),
        base_dir.to_path_buf(),
        events_tx,
    ) {
        Ok(server) => {
            thread::spawn(move || server.serve());
        }
        Err(err) => error!("cannot start the control server: {err}"),
    }

    // Parse unit files; a re-exec counts as a reload so restored runtime
    // state survives. Boot continues on rejection with whatever the table
    // holds.
    if let Err(err) = config::load_services(&table, base_dir, resumed) {
        error!("failed to load service configuration: {err}");
    }

    if !resumed {
        supervisor.start_boot_services();
    }

    // The log directory may live on a filesystem the services just
    // mounted, so the file sink attaches only now.
    if let Err(err) = logging::attach_file(&main_config.log.filename) {
        error!("failed to attach the file log: {err}");
    }

    thread::spawn(|| reaper::reap_children());

    let event_table = Arc::clone(&table);
    let event_pool = Arc::clone(&pool);
    thread::spawn(move || {
        power_event_loop(events_rx, event_table, event_pool)
    });

    getty::manage_gettys(
        &pool,
        main_config.persist,
        &main_config.autologins,
        resumed,
    );

    // The ttys exited. Kill processes, unmount filesystems and halt.
    shutdown::run(false);
    process::exit(0);
}

/// Waits for shutdown/reboot/re-exec instructions from the control server.
fn power_event_loop(
    events: mpsc::Receiver<PowerEvent>,
    table: Arc<ServiceTable>,
    pool: Arc<GettyPool>,
) {
    for event in events {
        match event {
            PowerEvent::Shutdown { reboot } => {
                info!("I was asked to {}, goodbye!", if reboot {
                    "reboot"
                } else {
                    "shutdown"
                });
                shutdown::run(reboot);
            }
            PowerEvent::Reexec => {
                // The file may sit on a filesystem about to be remounted by
                // the new image.
                logging::detach_file();
                let err = reexec::perform(&table, &pool);
                error!("re-exec failed, still running the old image: {err}");
            }
        }
    }
}

/// Writes `/etc/hostname` into the kernel so getty greets with a name.
fn set_hostname() {
    match fs::read_to_string("/etc/hostname") {
        Ok(hostname) => {
            if let Err(err) =
                fs::write("/proc/sys/kernel/hostname", hostname.trim())
            {
                error!("error setting hostname: {err}");
            }
        }
        Err(err) => error!("error reading /etc/hostname: {err}"),
    }
}

/// Offline inspection: parse the unit files and print one line per unit.
fn services_list(base_dir: &Path) {
    let units = match config::load_unit_dir(base_dir) {
        Ok(units) => units,
        Err(err) => {
            error!("cannot load unit files: {err}");
            process::exit(1);
        }
    };

    let mut names: Vec<&String> = units.keys().collect();
    names.sort();

    println!(
        "{:<30} {:<8} {:<25} {:<25} {:<25}",
        "NAME", "TYPE", "REQUIRES", "AFTER", "BEFORE"
    );
    for name in names {
        let unit = &units[name];
        println!(
            "{:<30} {:<8} {:<25} {:<25} {:<25}",
            unit.name,
            unit.kind.label(),
            unit.requires.join(","),
            unit.after.join(","),
            unit.before.join(",")
        );
    }
}

/// Offline inspection: parse the unit files and print the boot order,
/// targets first, members below them.
fn services_tree(base_dir: &Path) {
    let units = match config::load_unit_dir(base_dir) {
        Ok(units) => units,
        Err(err) => {
            error!("cannot load unit files: {err}");
            process::exit(1);
        }
    };

    let order = match deps::sort(&units) {
        Ok(order) => order,
        Err(err) => {
            error!("{err}");
            process::exit(1);
        }
    };

    println!("Boot services order:");
    for target in &order.targets_order {
        println!("+ {target}");
        if let Some(members) = order.services_order.get(target) {
            for member in members {
                println!(" \\__ {member}");
            }
        }
    }
}
