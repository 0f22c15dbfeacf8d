//! Password/credential coordinator
//!
//! Drives `SecureIo::create()` across "password needed" and "wrong password"
//! outcomes. Passwords typed by the user are cached by the identity of the
//! key material they unlock, so later connections with the same files do
//! not prompt again.

use super::config::{FileType, Overrides, TlsConfig};
use super::error::{InitError, TlsError};
use super::{Result, SecureIo};
use std::collections::HashMap;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

/// Error text when no password can be obtained
pub const PASSWORD_UNAVAILABLE: &str = "Private key password needed but not available";

/// What the prompt is asked for
#[derive(Debug, Clone, Copy)]
pub struct PasswordRequest<'a> {
    pub key_file: Option<&'a Path>,
    pub client_cert: Option<&'a str>,
    /// A previous password for the same key was rejected
    pub again: bool,
}

impl PasswordRequest<'_> {
    /// Prompt text for interactive front ends
    pub fn message(&self) -> String {
        let target = match (self.key_file, self.client_cert) {
            (Some(path), _) => format!("private key {}", path.display()),
            (None, Some(name)) => format!("client certificate '{}'", name),
            (None, None) => "private key".to_string(),
        };
        if self.again {
            format!("Password incorrect. Password for {}: ", target)
        } else {
            format!("Password for {}: ", target)
        }
    }
}

/// Answer from a password prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// The password, available right away
    Supplied(String),
    /// The front end will answer later through
    /// `Coordinator::password_supplied()`
    Pending,
    /// No way to ask, or the user declined
    Unavailable,
}

/// Source of interactively entered passwords
pub trait PasswordPrompt {
    fn prompt(&mut self, request: &PasswordRequest<'_>) -> PromptOutcome;
}

impl<F> PasswordPrompt for F
where
    F: FnMut(&PasswordRequest<'_>) -> PromptOutcome,
{
    fn prompt(&mut self, request: &PasswordRequest<'_>) -> PromptOutcome {
        self(request)
    }
}

/// Prompt that never has a password
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompt;

impl PasswordPrompt for NoPrompt {
    fn prompt(&mut self, _request: &PasswordRequest<'_>) -> PromptOutcome {
        PromptOutcome::Unavailable
    }
}

/// Reads the password from the controlling terminal with echo disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl PasswordPrompt for TerminalPrompt {
    fn prompt(&mut self, request: &PasswordRequest<'_>) -> PromptOutcome {
        match read_password(&request.message()) {
            Ok(Some(password)) => PromptOutcome::Supplied(password),
            Ok(None) => PromptOutcome::Unavailable,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read password from terminal");
                PromptOutcome::Unavailable
            }
        }
    }
}

/// Restores the saved terminal attributes when dropped
#[cfg(unix)]
struct EchoGuard {
    fd: libc::c_int,
    saved: libc::termios,
}

#[cfg(unix)]
impl EchoGuard {
    fn disable(fd: libc::c_int) -> io::Result<Self> {
        let mut term: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut term) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let saved = term;
        term.c_lflag &= !libc::ECHO;
        term.c_lflag |= libc::ECHONL;
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &term) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EchoGuard { fd, saved })
    }
}

#[cfg(unix)]
impl Drop for EchoGuard {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.saved);
        }
    }
}

fn read_password(message: &str) -> io::Result<Option<String>> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        return Ok(None);
    }

    let mut stderr = io::stderr();
    stderr.write_all(message.as_bytes())?;
    stderr.flush()?;

    #[cfg(unix)]
    let _guard = {
        use std::os::fd::AsRawFd;
        EchoGuard::disable(stdin.as_raw_fd())?
    };

    let mut line = String::new();
    if stdin.lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Identity of the key material a password unlocks
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    cert_file: Option<PathBuf>,
    cert_file_type: FileType,
    chain_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    key_file_type: FileType,
    client_cert: Option<String>,
}

impl CacheKey {
    fn of(config: &TlsConfig) -> Self {
        CacheKey {
            cert_file: config.cert_file.clone(),
            cert_file_type: config.cert_file_type,
            chain_file: config.chain_file.clone(),
            key_file: config.key_file.clone(),
            key_file_type: config.key_file_type,
            client_cert: config.client_cert.clone(),
        }
    }
}

/// Outcome of a coordinated `create()`
#[derive(Debug)]
pub enum Attempt<S> {
    /// Credentialed session, ready to negotiate
    Ready(S),
    /// Waiting on the prompt; finish with `Coordinator::password_supplied()`
    Pending,
}

impl<S> Attempt<S> {
    pub fn ready(self) -> Option<S> {
        match self {
            Attempt::Ready(session) => Some(session),
            Attempt::Pending => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Attempt::Pending)
    }
}

/// A retry loop parked on an asynchronous prompt
#[derive(Debug)]
struct PendingLoop {
    config: TlsConfig,
    again: bool,
}

/// Retries session creation across password prompts
pub struct Coordinator<B: SecureIo> {
    backend: B,
    config: TlsConfig,
    cache: HashMap<CacheKey, String>,
    pending: Option<PendingLoop>,
}

impl<B: SecureIo> Coordinator<B> {
    pub fn new(backend: B, config: TlsConfig) -> Self {
        Coordinator {
            backend,
            config,
            cache: HashMap::new(),
            pending: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Global configuration the per-call copies start from
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    /// Replace the global configuration. Cached passwords stay valid for
    /// key material that did not change.
    pub fn set_config(&mut self, config: TlsConfig) {
        self.config = config;
    }

    /// Whether a retry loop is waiting on the prompt
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Cached password for the key material of `config`
    pub fn cached_password(&self, config: &TlsConfig) -> Option<&str> {
        self.cache.get(&CacheKey::of(config)).map(String::as_str)
    }

    /// Create a session, prompting for a password as needed.
    ///
    /// An explicit `password` is not retried: if it is wrong the error is
    /// returned. Otherwise the cache is consulted first and the prompt is
    /// asked until the key opens or the prompt gives up.
    pub fn negotiate_with_retry(
        &mut self,
        prompt: &mut dyn PasswordPrompt,
        password: Option<&str>,
        overrides: &Overrides,
    ) -> Result<Attempt<B::Session>> {
        if self.pending.is_some() {
            return Err(TlsError::InvalidHandle("password prompt already pending"));
        }

        let config = self.config.with_overrides(overrides);
        let explicit = password.is_some();
        let password = match password {
            Some(password) => Some(password.to_string()),
            None => self.cached_password(&config).map(str::to_string),
        };
        self.run(prompt, config, password, explicit, false)
    }

    /// Resume a loop that returned `Attempt::Pending`. `None` means the
    /// front end could not obtain a password.
    pub fn password_supplied(
        &mut self,
        prompt: &mut dyn PasswordPrompt,
        password: Option<String>,
    ) -> Result<Attempt<B::Session>> {
        let pending = self
            .pending
            .take()
            .ok_or(TlsError::InvalidHandle("no password prompt pending"))?;

        match password {
            Some(password) => self.run(prompt, pending.config, Some(password), false, pending.again),
            None => Err(TlsError::config(PASSWORD_UNAVAILABLE)),
        }
    }

    fn run(
        &mut self,
        prompt: &mut dyn PasswordPrompt,
        config: TlsConfig,
        mut password: Option<String>,
        explicit: bool,
        mut again: bool,
    ) -> Result<Attempt<B::Session>> {
        loop {
            match self.backend.create(&config, password.as_deref()) {
                Ok(session) => {
                    // Only a password the key accepted is remembered
                    if let (false, Some(password)) = (explicit, password) {
                        self.cache.insert(CacheKey::of(&config), password);
                    }
                    return Ok(Attempt::Ready(session));
                }
                Err(InitError::Failed(e)) => return Err(e),
                Err(InitError::WrongPassword) if explicit => {
                    return Err(TlsError::config(InitError::WrongPassword.to_string()));
                }
                Err(InitError::WrongPassword) => {
                    tracing::debug!("private key password rejected; asking again");
                    self.cache.remove(&CacheKey::of(&config));
                    again = true;
                }
                Err(InitError::NeedPassword) => {
                    tracing::debug!("private key password needed");
                }
            }

            let request = PasswordRequest {
                key_file: config.key_file.as_deref(),
                client_cert: config.client_cert.as_deref(),
                again,
            };
            match prompt.prompt(&request) {
                PromptOutcome::Supplied(supplied) => password = Some(supplied),
                PromptOutcome::Pending => {
                    self.pending = Some(PendingLoop { config, again });
                    return Ok(Attempt::Pending);
                }
                PromptOutcome::Unavailable => return Err(TlsError::config(PASSWORD_UNAVAILABLE)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sio::mock::{MockBackend, MockMode, KEY_PASSWORD};

    fn keyed_config() -> TlsConfig {
        TlsConfig::builder()
            .cert_file("client.pem", FileType::Pem)
            .key_file("client.key", FileType::Pem)
            .build()
            .unwrap()
    }

    #[test]
    fn test_prompted_password_is_cached() {
        let mut coordinator = Coordinator::new(MockBackend::new(MockMode::Normal), keyed_config());
        let mut asked = 0;
        let mut prompt = |_: &PasswordRequest<'_>| {
            asked += 1;
            PromptOutcome::Supplied(KEY_PASSWORD.to_string())
        };

        let attempt = coordinator
            .negotiate_with_retry(&mut prompt, None, &Overrides::default())
            .unwrap();
        assert!(attempt.ready().is_some());

        // Second connection uses the cache
        let attempt = coordinator
            .negotiate_with_retry(&mut prompt, None, &Overrides::default())
            .unwrap();
        assert!(attempt.ready().is_some());
        assert_eq!(asked, 1);
        assert_eq!(
            coordinator.cached_password(&keyed_config()),
            Some(KEY_PASSWORD)
        );
    }

    #[test]
    fn test_wrong_prompted_password_asks_again() {
        let mut coordinator = Coordinator::new(MockBackend::new(MockMode::Normal), keyed_config());
        let mut answers = vec!["first-guess", KEY_PASSWORD].into_iter();
        let mut flags = Vec::new();
        let mut prompt = |request: &PasswordRequest<'_>| {
            flags.push(request.again);
            PromptOutcome::Supplied(answers.next().unwrap_or_default().to_string())
        };

        let attempt = coordinator
            .negotiate_with_retry(&mut prompt, None, &Overrides::default())
            .unwrap();
        assert!(attempt.ready().is_some());
        assert_eq!(flags, vec![false, true]);
    }

    #[test]
    fn test_rejected_password_is_not_cached() {
        let mut coordinator = Coordinator::new(MockBackend::new(MockMode::Normal), keyed_config());
        let mut answers = vec![PromptOutcome::Supplied("first-guess".to_string())].into_iter();
        let mut prompt = |_: &PasswordRequest<'_>| answers.next().unwrap_or(PromptOutcome::Unavailable);

        assert!(coordinator
            .negotiate_with_retry(&mut prompt, None, &Overrides::default())
            .is_err());
        assert_eq!(coordinator.cached_password(&keyed_config()), None);
    }

    #[test]
    fn test_rejected_deferred_password_is_not_cached() {
        let mut coordinator = Coordinator::new(MockBackend::new(MockMode::Normal), keyed_config());
        let mut defer = |_: &PasswordRequest<'_>| PromptOutcome::Pending;
        coordinator
            .negotiate_with_retry(&mut defer, None, &Overrides::default())
            .unwrap();

        // The wrong answer parks the loop again without touching the cache
        let attempt = coordinator
            .password_supplied(&mut defer, Some("first-guess".to_string()))
            .unwrap();
        assert!(attempt.is_pending());
        assert_eq!(coordinator.cached_password(&keyed_config()), None);

        let attempt = coordinator
            .password_supplied(&mut defer, Some(KEY_PASSWORD.to_string()))
            .unwrap();
        assert!(attempt.ready().is_some());
        assert_eq!(coordinator.cached_password(&keyed_config()), Some(KEY_PASSWORD));
    }

    #[test]
    fn test_explicit_wrong_password_is_fatal() {
        let mut coordinator = Coordinator::new(MockBackend::new(MockMode::Normal), keyed_config());
        let err = coordinator
            .negotiate_with_retry(&mut NoPrompt, Some("wrong"), &Overrides::default())
            .unwrap_err();
        assert!(matches!(err, TlsError::Configuration(_)));
        assert!(err.to_string().contains("Incorrect"));
    }

    #[test]
    fn test_unavailable_prompt() {
        let mut coordinator = Coordinator::new(MockBackend::new(MockMode::Normal), keyed_config());
        let err = coordinator
            .negotiate_with_retry(&mut NoPrompt, None, &Overrides::default())
            .unwrap_err();
        assert_eq!(err.to_string(), format!("Configuration error: {}", PASSWORD_UNAVAILABLE));
    }

    #[test]
    fn test_pending_prompt_resumes() {
        let mut coordinator = Coordinator::new(MockBackend::new(MockMode::Normal), keyed_config());
        let mut defer = |_: &PasswordRequest<'_>| PromptOutcome::Pending;

        let attempt = coordinator
            .negotiate_with_retry(&mut defer, None, &Overrides::default())
            .unwrap();
        assert!(attempt.is_pending());
        assert!(coordinator.is_pending());

        // Only one loop may be outstanding
        assert!(matches!(
            coordinator.negotiate_with_retry(&mut defer, None, &Overrides::default()),
            Err(TlsError::InvalidHandle(_))
        ));

        let attempt = coordinator
            .password_supplied(&mut defer, Some(KEY_PASSWORD.to_string()))
            .unwrap();
        assert!(attempt.ready().is_some());
        assert!(!coordinator.is_pending());

        assert!(matches!(
            coordinator.password_supplied(&mut defer, None),
            Err(TlsError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_pending_prompt_cancelled() {
        let mut coordinator = Coordinator::new(MockBackend::new(MockMode::Normal), keyed_config());
        let mut defer = |_: &PasswordRequest<'_>| PromptOutcome::Pending;
        coordinator
            .negotiate_with_retry(&mut defer, None, &Overrides::default())
            .unwrap();
        assert!(coordinator.password_supplied(&mut defer, None).is_err());
        assert!(!coordinator.is_pending());
    }

    #[test]
    fn test_failure_is_not_retried() {
        let mut coordinator =
            Coordinator::new(MockBackend::new(MockMode::InitFailure), TlsConfig::default());
        let mut prompt = |_: &PasswordRequest<'_>| -> PromptOutcome {
            panic!("prompt must not be asked")
        };
        assert!(matches!(
            coordinator.negotiate_with_retry(&mut prompt, None, &Overrides::default()),
            Err(TlsError::Protocol { .. })
        ));
    }

    #[test]
    fn test_request_message() {
        let request = PasswordRequest {
            key_file: Some(Path::new("/keys/client.key")),
            client_cert: None,
            again: true,
        };
        assert_eq!(
            request.message(),
            "Password incorrect. Password for private key /keys/client.key: "
        );
    }
}
