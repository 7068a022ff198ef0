use std::env;
use std::process;
use std::time::Duration;

use tunsock::net::{self, FdRegistry, Family};
use tunsock::{error, info, warn};

/// How long one control-loop cycle waits for readiness before draining
/// error queues.
const TICK: Duration = Duration::from_secs(1);

fn main() {
    let mut args = env::args().skip(1);
    let bind_addr = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args.next().and_then(|port| port.parse().ok()).unwrap_or(5001);

    let mut registry = FdRegistry::new();

    // The only place a fatal-kind result becomes process termination: sweep
    // every registered descriptor first, then exit non-zero.
    if let Err(err) = run(&bind_addr, port, &mut registry) {
        registry.close_all();
        error!("{err}");
        process::exit(1);
    }

    // Orderly shutdown sweeps the same registry.
    registry.close_all();
}

/// Echo loop demonstrating the transport substrate: wait for readiness,
/// echo datagrams back to their source, and drain the error queue on idle
/// ticks. Only fatal-kind failures propagate out.
fn run(bind_addr: &str, port: u16, registry: &mut FdRegistry) -> tunsock::Result<()> {
    if !net::raw_socket_supported() {
        warn!("raw sockets unsupported on this platform, running UDP-only");
    }

    let sock = net::udp_sock(Family::V4, port, Some(bind_addr), true, registry)?;
    info!("listening on {}", sock.local_addr());

    match net::interface_for_local_addr(sock.local_addr().ip())? {
        Some(itf) => info!("bound address is carried by interface {itf}"),
        None => warn!("no local interface owns {}", sock.local_addr().ip()),
    }

    let mut buf = [0u8; 2048];
    let mut scratch = [0u8; 1500];

    loop {
        let ready = net::wait_readable(&[sock.fd()], Some(TICK))?;

        if ready.is_empty() {
            // Idle tick: surface any pending error-queue entries.
            match net::drain(&sock, &mut scratch, None, None) {
                Ok(reports) => {
                    for report in reports {
                        warn!(
                            "network error from {:?}: type {} code {}{}",
                            report.peer,
                            report.category,
                            report.code,
                            report
                                .mtu_hint()
                                .map(|mtu| format!(" (path MTU {mtu})"))
                                .unwrap_or_default()
                        );
                    }
                }
                Err(err) if !err.is_fatal() => warn!("{err}"),
                Err(err) => return Err(err),
            }
            continue;
        }

        let (nbytes, peer) = net::recv_from(&sock, &mut buf)?;
        net::send_to(&sock, &peer, &buf[..nbytes])?;
    }
}
