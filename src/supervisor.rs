//! The main loop: drives the server's event-loop iterations and the
//! simulation tick from a single thread, and watches for the shutdown
//! signal.
//!
//! A signal handler does nothing but an atomic store into a shared
//! flag; the loop itself polls that flag, the one signal-safe operation
//! a handler is allowed to perform, and does all the actual shutdown
//! work (logging, session teardown) once it observes the flag set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;

use crate::registry::Registry;
use crate::server::Server;

fn register_signals(flag: &Arc<AtomicBool>) -> anyhow::Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(flag))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(flag))?;
    Ok(())
}

/// Runs the server and the simulation until SIGTERM/SIGINT is observed.
/// `tick_period` is the simulation step; the event loop itself is driven
/// as fast as `poll(2)` returns, subject to its own readiness timeout.
pub fn run(mut server: Server, mut registry: Registry, tick_period: Duration) -> anyhow::Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    register_signals(&shutdown)?;

    let mut last_tick = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        server.run_once(&mut registry);

        let now = Instant::now();
        let elapsed = now.duration_since(last_tick);
        if elapsed >= tick_period {
            let dt = elapsed.as_secs_f64();
            registry.update(dt);
            last_tick = now;
        }
    }

    info!(
        "shutdown signal received, closing {} active session(s)",
        server.active_sessions()
    );
    server.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::mpsc;

    #[test]
    fn stops_promptly_once_flag_is_set() {
        let cfg = Config::default();
        let mut cfg = cfg;
        cfg.bind = "127.0.0.1".to_owned();
        cfg.port = 0;
        let server = Server::bind(&cfg).unwrap();
        let mut registry = Registry::new(cfg.max_pvs, cfg.max_motors);
        registry.init();

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let (done_tx, done_rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut server = server;
            let mut last_tick = Instant::now();
            let tick_period = Duration::from_millis(10);
            while !shutdown_clone.load(Ordering::SeqCst) {
                server.run_once(&mut registry);
                let now = Instant::now();
                if now.duration_since(last_tick) >= tick_period {
                    registry.update(now.duration_since(last_tick).as_secs_f64());
                    last_tick = now;
                }
            }
            done_tx.send(()).ok();
        });

        std::thread::sleep(Duration::from_millis(50));
        shutdown.store(true, Ordering::SeqCst);
        done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("loop should observe the shutdown flag and return promptly");
    }
}
