//! Liveness probes for encoder processes and their ports.
//!
//! Nothing in here returns an error to the caller: a probe that cannot
//! decide reports "not alive".

use std::io;
use std::net::TcpListener;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use tokio::net::TcpStream;

/// Host to bind when the channel has no interface configured.
pub fn bind_host(interface: &str) -> &str {
    match interface.trim() {
        "" => "0.0.0.0",
        other => other,
    }
}

/// Host to connect to for a channel bound on `interface`.
///
/// Wildcard binds are reached over loopback.
pub fn connect_host(interface: &str) -> &str {
    match interface.trim() {
        "" | "0.0.0.0" => "127.0.0.1",
        "::" | "[::]" => "::1",
        other => other,
    }
}

/// `host:port` form suitable for URLs and connects.
pub fn connect_addr(interface: &str, port: u16) -> String {
    let host = connect_host(interface);
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Whether `pid` names a live (non-zombie) process.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));

    match sys.process(pid) {
        Some(process) => !matches!(
            process.status(),
            ProcessStatus::Zombie | ProcessStatus::Dead
        ),
        None => false,
    }
}

/// Ask `pid` to terminate. Returns false when there was nothing to signal.
pub fn terminate(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));

    match sys.process(pid) {
        Some(process) => process
            .kill_with(Signal::Term)
            .unwrap_or_else(|| process.kill()),
        None => false,
    }
}

/// Terminate a leftover encoder recorded with `start_date`.
///
/// A process that started after `start_date` reused the pid and is left
/// alone. Returns whether a signal was sent.
pub fn terminate_stale(pid: u32, start_date: i64) -> bool {
    if pid == 0 {
        return false;
    }
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));

    match sys.process(pid) {
        Some(process) if process.start_time() as i64 <= start_date => process
            .kill_with(Signal::Term)
            .unwrap_or_else(|| process.kill()),
        _ => false,
    }
}

/// Whether something accepts TCP connections on the channel endpoint.
pub async fn port_accepting(interface: &str, port: u16, timeout: Duration) -> bool {
    if port == 0 {
        return false;
    }
    let addr = connect_addr(interface, port);
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr.as_str())).await,
        Ok(Ok(_))
    )
}

/// Check that the endpoint can still be bound by a new encoder.
pub fn port_available(interface: &str, port: u16) -> io::Result<()> {
    let listener = TcpListener::bind((bind_host(interface), port))?;
    drop(listener);
    Ok(())
}

/// Let the OS pick a free loopback port.
pub fn free_loopback_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_host_maps_wildcards() {
        assert_eq!(connect_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(connect_host(""), "127.0.0.1");
        assert_eq!(connect_host("::"), "::1");
        assert_eq!(connect_host("192.168.1.5"), "192.168.1.5");
    }

    #[test]
    fn test_connect_addr_brackets_ipv6() {
        assert_eq!(connect_addr("::", 8200), "[::1]:8200");
        assert_eq!(connect_addr("0.0.0.0", 8200), "127.0.0.1:8200");
    }

    #[test]
    fn test_pid_zero_is_never_alive() {
        assert!(!pid_alive(0));
        assert!(!terminate(0));
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[tokio::test]
    async fn test_terminate_stale_spares_reused_pid() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        assert!(!terminate_stale(pid, 1_000));
        assert!(pid_alive(pid));

        let recorded_after_spawn = crate::unix_now() + 5;
        assert!(terminate_stale(pid, recorded_after_spawn));
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_bound_port_is_not_available() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = port_available("127.0.0.1", port).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn test_port_accepting() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_accepting("127.0.0.1", port, Duration::from_millis(500)).await);

        drop(listener);
        assert!(!port_accepting("127.0.0.1", port, Duration::from_millis(200)).await);
        assert!(!port_accepting("127.0.0.1", 0, Duration::from_millis(200)).await);
    }
}
