//! The petrel-client daemon.
//!
//! Startup order matters: crash handlers first, then options and logging,
//! then caches, then the device and its mapped regions, and only then the
//! remount helper, gated until the initial unexpected receives are parked.
//! Teardown runs in reverse. Exit codes tell the supervisor whether a
//! restart is worthwhile.

use std::process::exit;

use log::{debug, error, info};

use petrel_client::buffers::PoolParams;
use petrel_client::client::ClientCore;
use petrel_client::device::{CharDevice, VfsDevice, DEVICE_PATH};
use petrel_client::error::{RunError, EXIT_RETRY};
use petrel_client::options::{ClientOptions, ParseError};
use petrel_client::remount::{self, RemountState, RemountStatus};
use petrel_client::sys::local::LocalSys;
use petrel_client::{logging, signals};

fn main() {
    signals::install();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = match ClientOptions::parse(&args) {
        Ok(opts) => opts,
        Err(ParseError::Help) => {
            print!("{}", ClientOptions::help("petrel-client"));
            exit(0);
        }
        Err(e) => {
            eprintln!("petrel-client: {e}");
            exit(1);
        }
    };

    // Under a supervising parent a crash-looping core must not fill the
    // disk with dumps.
    if opts.child {
        let lim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &lim) } != 0 {
            eprintln!("petrel-client: setrlimit failed; continuing");
        }
    }

    if let Err(e) = logging::init(&opts) {
        eprintln!("petrel-client: error opening log sink: {e}");
        exit(1);
    }

    info!("petrel client daemon started");

    let mut dev = match CharDevice::open(DEVICE_PATH) {
        Ok(dev) => dev,
        Err(e) => {
            error!("{}", RunError::DeviceInit(e));
            exit(EXIT_RETRY);
        }
    };

    debug!("setup I/O transfer regions");
    let io_params = PoolParams {
        count: opts.desc_count,
        size: opts.desc_size,
    };
    let readdir_params = PoolParams {
        count: 8,
        size: 65536,
    };
    let (io_pool, dir_pool) = match dev.map_pools(io_params, readdir_params) {
        Ok(pools) => pools,
        Err(e) => {
            error!("{}", RunError::MappedRegion(e));
            exit(EXIT_RETRY);
        }
    };

    // The engine seam. This tree ships the embedded single-node engine;
    // a clustered engine slots in through the same trait.
    let mut sys = LocalSys::new();
    if !opts.standalone {
        debug!("no cluster transport configured; using the embedded engine");
    }
    debug!("set cache perf counters");
    for subsystem in [
        petrel_abi::subsystem::ACACHE,
        petrel_abi::subsystem::NCACHE,
        petrel_abi::subsystem::CAPCACHE,
    ] {
        petrel_client::sys::Sys::set_perf_params(
            &mut sys,
            subsystem,
            opts.perf_history_size,
            opts.perf_time_interval_secs,
        );
    }

    let remounter = dev.remounter();
    let remount = RemountState::new();

    debug!("init client core");
    let mut core = ClientCore::new(
        opts,
        Box::new(dev),
        Box::new(sys),
        io_pool,
        dir_pool,
        std::sync::Arc::clone(&remount),
    );

    // Hold the gate until the descriptor ring is parked, then let the
    // helper thread issue the blocking remount ioctl.
    let gate = remount.hold_gate();
    debug!("create remount thread");
    let remount_thread = match remount::spawn(std::sync::Arc::clone(&remount), remounter) {
        Ok(handle) => handle,
        Err(e) => {
            error!("{}", RunError::ThreadSpawn(e));
            exit(1);
        }
    };
    drop(gate);

    debug!("start processing requests");
    let result = core.process_requests();

    debug!("shutting down");
    core.shutdown();
    drop(core);

    if remount.status() == RemountStatus::Completed {
        let _ = remount_thread.join();
    }

    match result {
        Ok(()) => {
            info!("petrel-client shutting down");
            log::logger().flush();
            signals::reraise_to_group();
            exit(0);
        }
        Err(e) => {
            error!("{e}");
            log::logger().flush();
            exit(e.exit_code());
        }
    }
}
