//! sio-probe: open one secure session and describe it
//!
//! Every TLS switch the active backend supports is available on the command
//! line, e.g.
//!
//! ```text
//! sio-probe --ca-file ca.pem --client-cert alice host.example:992
//! sio-probe --mock host.example
//! ```

use clap::{Arg, ArgAction, ArgMatches, Command};
use secio::sio::mock::{self, MockBackend, PeerConfig};
use secio::sio::password::TerminalPrompt;
use secio::sio::{
    ActiveBackend, Attempt, Coordinator, Negotiation, OptionRegistry, Overrides, ReadStatus, SecureIo,
    SecureSession, TlsConfig, TlsError,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{TcpStream, ToSocketAddrs};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 992;

fn base_command() -> Command {
    Command::new("sio-probe")
        .about("Negotiate a TLS session and print what was negotiated")
        .arg(Arg::new("host").required_unless_present("list-options").help("HOST[:PORT]"))
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Load TLS settings from a JSON file before applying switches"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECS")
                .default_value("10")
                .value_parser(clap::value_parser!(u64))
                .help("Connect and negotiation timeout"),
        )
        .arg(
            Arg::new("send")
                .long("send")
                .value_name("TEXT")
                .help("Send TEXT after negotiation and print the reply"),
        )
        .arg(
            Arg::new("show-cert")
                .long("show-cert")
                .action(ArgAction::SetTrue)
                .help("Print the host certificate chain"),
        )
        .arg(
            Arg::new("list-options")
                .long("list-options")
                .action(ArgAction::SetTrue)
                .help("List the TLS options this build supports and exit"),
        )
        .arg(
            Arg::new("mock")
                .long("mock")
                .action(ArgAction::SetTrue)
                .help("Talk to an in-process mock peer instead of the network"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("FILTER")
                .default_value("warn")
                .help("Log filter when RUST_LOG is not set"),
        )
}

fn split_host(target: &str) -> (String, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') || host.starts_with('[') => match port.parse() {
            Ok(port) => (host.trim_matches(['[', ']']).to_string(), port),
            Err(_) => (target.to_string(), DEFAULT_PORT),
        },
        _ => (target.to_string(), DEFAULT_PORT),
    }
}

fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, TlsError> {
    let mut last = None;
    for addr in (host, port).to_socket_addrs()? {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        match socket.connect_timeout(&addr.into(), timeout) {
            Ok(()) => {
                socket.set_nodelay(true)?;
                socket.set_nonblocking(true)?;
                tracing::debug!(%addr, "connected");
                return Ok(socket.into());
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect failed");
                last = Some(e);
            }
        }
    }
    Err(last
        .map(TlsError::from)
        .unwrap_or_else(|| TlsError::config(format!("No address for {}", host))))
}

/// Wait until `stream` is readable or `timeout` passes
#[cfg(unix)]
fn wait_readable(stream: &TcpStream, timeout: Duration) -> Result<bool, TlsError> {
    use std::os::fd::AsRawFd;

    let mut pfd = libc::pollfd {
        fd: stream.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let result = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if result < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(result > 0)
}

#[cfg(not(unix))]
fn wait_readable(_stream: &TcpStream, timeout: Duration) -> Result<bool, TlsError> {
    std::thread::sleep(timeout.min(Duration::from_millis(20)));
    Ok(true)
}

fn describe<S: SecureSession>(session: &S, show_cert: bool) {
    if let Some(info) = session.session_info() {
        print!("{}", info);
    }
    if show_cert {
        if let Some(cert) = session.server_cert_info() {
            print!("{}", cert);
        }
    }
    if let Some(names) = session.server_subject_names() {
        println!("Subject names: {}", names.join(", "));
    }
    if session.secure_unverified() {
        println!("WARNING: host certificate was not verified");
    }
}

fn probe_network(matches: &ArgMatches, config: TlsConfig) -> Result<(), TlsError> {
    let target = matches.get_one::<String>("host").map(String::as_str).unwrap_or_default();
    let (host, port) = split_host(target);
    let timeout = Duration::from_secs(matches.get_one::<u64>("timeout").copied().unwrap_or(10));

    let backend = ActiveBackend::default();
    println!("Provider: {}", backend.provider_name());
    if config.starttls {
        tracing::info!("starttls is set; the probe negotiates immediately");
    }

    let mut coordinator = Coordinator::new(backend, config);
    let mut session = match coordinator.negotiate_with_retry(&mut TerminalPrompt, None, &Overrides::default())? {
        Attempt::Ready(session) => session,
        Attempt::Pending => return Err(TlsError::config("password prompt did not complete")),
    };

    let stream = connect(&host, port, timeout)?;
    let watcher = stream.try_clone()?;
    let deadline = Instant::now() + timeout;

    let mut status = session.negotiate(Box::new(stream), &host)?;
    while status == Negotiation::WantMore {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(TlsError::protocol("TLS negotiation timed out"));
        }
        wait_readable(&watcher, left)?;
        status = session.resume()?;
    }
    describe(&session, matches.get_flag("show-cert"));

    if let Some(text) = matches.get_one::<String>("send") {
        session.write(format!("{}\r\n", text).as_bytes())?;
        let mut buf = [0u8; 4096];
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match session.read(&mut buf)? {
                ReadStatus::Data(n) => print!("{}", String::from_utf8_lossy(&buf[..n])),
                ReadStatus::Eof => break,
                ReadStatus::WouldBlock if left.is_zero() => break,
                ReadStatus::WouldBlock => {
                    wait_readable(&watcher, left)?;
                }
            }
        }
        println!();
    }

    session.close();
    Ok(())
}

fn probe_mock(matches: &ArgMatches, config: TlsConfig) -> Result<(), TlsError> {
    let target = matches.get_one::<String>("host").map(String::as_str).unwrap_or("mock.test");
    let (host, _) = split_host(target);
    let backend = MockBackend::default();
    println!("Provider: {} ({})", backend.provider_name(), backend.mode());

    let (mut session, mut peer) = mock::connect(&backend, &config, PeerConfig::new(host.clone()), &host)?;
    describe(&session, matches.get_flag("show-cert"));

    if let Some(text) = matches.get_one::<String>("send") {
        session.write(text.as_bytes())?;
        peer.poll()?;
        let mut buf = [0u8; 4096];
        if let ReadStatus::Data(n) = session.read(&mut buf)? {
            println!("{}", String::from_utf8_lossy(&buf[..n]));
        }
    }
    session.close();
    Ok(())
}

fn run() -> Result<(), TlsError> {
    let registry = OptionRegistry::new(ActiveBackend::default().options_supported());
    let matches = registry.command(base_command()).get_matches();

    let filter = matches.get_one::<String>("log-level").map(String::as_str).unwrap_or("warn");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    if matches.get_flag("list-options") {
        for option in registry.list_supported_options() {
            println!("{:<20} {:<24} {}", option.name, option.resource, option.help);
        }
        return Ok(());
    }

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => TlsConfig::from_json_file(path)?,
        None => TlsConfig::default(),
    };
    registry.apply_matches(&matches, &mut config)?;
    config.validate()?;

    if matches.get_flag("mock") {
        probe_mock(&matches, config)
    } else {
        probe_network(&matches, config)
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("sio-probe: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host() {
        assert_eq!(split_host("host.example"), ("host.example".to_string(), DEFAULT_PORT));
        assert_eq!(split_host("host.example:23"), ("host.example".to_string(), 23));
        assert_eq!(split_host("[::1]:992"), ("::1".to_string(), 992));
        assert_eq!(split_host("::1"), ("::1".to_string(), DEFAULT_PORT));
    }

    #[test]
    fn test_command_has_backend_options() {
        let registry = OptionRegistry::new(ActiveBackend::default().options_supported());
        let matches = registry
            .command(base_command())
            .try_get_matches_from(["sio-probe", "--no-verify-host-cert", "host.example"])
            .unwrap();
        let mut config = TlsConfig::default();
        registry.apply_matches(&matches, &mut config).unwrap();
        assert!(!config.verify_host_cert);
    }
}
