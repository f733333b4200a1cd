use std::path::PathBuf;

/// One remote (or local) exec target. The local variant exists for agents
/// running operations on their own host and for tests.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Local,
    Ssh {
        host: String,
        user: Option<String>,
        port: Option<u16>,
        identity_file: Option<PathBuf>,
    },
}

impl Endpoint {
    /// Argv for running `cmd` through this endpoint's shell.
    #[must_use]
    pub fn exec_argv(&self, cmd: &str) -> Vec<String> {
        match self {
            Self::Local => vec!["sh".to_owned(), "-c".to_owned(), cmd.to_owned()],
            Self::Ssh {
                host,
                user,
                port,
                identity_file,
            } => {
                let mut argv = vec![
                    "ssh".to_owned(),
                    "-o".to_owned(),
                    "BatchMode=yes".to_owned(),
                    "-o".to_owned(),
                    "StrictHostKeyChecking=no".to_owned(),
                ];
                if let Some(port) = port {
                    argv.push("-p".to_owned());
                    argv.push(port.to_string());
                }
                if let Some(identity) = identity_file {
                    argv.push("-i".to_owned());
                    argv.push(identity.display().to_string());
                }
                argv.push(Self::login_target(host, user.as_deref()));
                argv.push(cmd.to_owned());
                argv
            }
        }
    }

    /// Argv for pushing a file; `None` means the transfer is a plain
    /// filesystem copy (local endpoint).
    #[must_use]
    pub fn put_argv(&self, local: &str, remote: &str) -> Option<Vec<String>> {
        self.transfer_argv(local.to_owned(), self.remote_spec(remote)?)
    }

    /// Argv for pulling a file; `None` for the local endpoint.
    #[must_use]
    pub fn get_argv(&self, remote: &str, local: &str) -> Option<Vec<String>> {
        self.transfer_argv(self.remote_spec(remote)?, local.to_owned())
    }

    fn transfer_argv(&self, from: String, to: String) -> Option<Vec<String>> {
        match self {
            Self::Local => None,
            Self::Ssh {
                port,
                identity_file,
                ..
            } => {
                let mut argv = vec![
                    "scp".to_owned(),
                    "-o".to_owned(),
                    "BatchMode=yes".to_owned(),
                    "-o".to_owned(),
                    "StrictHostKeyChecking=no".to_owned(),
                ];
                if let Some(port) = port {
                    argv.push("-P".to_owned());
                    argv.push(port.to_string());
                }
                if let Some(identity) = identity_file {
                    argv.push("-i".to_owned());
                    argv.push(identity.display().to_string());
                }
                argv.push(from);
                argv.push(to);
                Some(argv)
            }
        }
    }

    fn remote_spec(&self, remote: &str) -> Option<String> {
        match self {
            Self::Local => None,
            Self::Ssh { host, user, .. } => Some(format!(
                "{}:{}",
                Self::login_target(host, user.as_deref()),
                remote
            )),
        }
    }

    fn login_target(host: &str, user: Option<&str>) -> String {
        match user {
            Some(user) => format!("{}@{}", user, host),
            None => host.to_owned(),
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Local => "local".to_owned(),
            Self::Ssh {
                host, user, port, ..
            } => {
                let target = Self::login_target(host, user.as_deref());
                match port {
                    Some(port) => format!("{}:{}", target, port),
                    None => target,
                }
            }
        }
    }
}
