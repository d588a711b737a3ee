//! Provider selection
//!
//! Maps a machine configuration and the runtime backend to a concrete
//! [`MachineProvider`].

use super::docker::DockerProvider;
use super::install::InstallPlan;
use super::lxd::LxdProvider;
use super::{Backend, MachineConfig, MachineProvider, Origin};
use crate::common::config::Timeouts;
use crate::common::{Error, Result};

/// Creates machines for scenario runs
///
/// `check` must reject everything `create` would reject, without side
/// effects, so that a run can validate its whole configuration before
/// provisioning anything.
pub trait ProviderFactory: Send + Sync {
    fn check(&self, config: &MachineConfig) -> Result<()>;

    fn create(&self, config: &MachineConfig, release: &str) -> Result<Box<dyn MachineProvider>>;
}

/// The factory for real LXD and Docker machines
#[derive(Debug, Clone)]
pub struct MachineFactory {
    backend: Backend,
    timeouts: Timeouts,
}

impl MachineFactory {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            timeouts: Timeouts::default(),
        }
    }

    /// Use `timeouts` for the backend commands of every machine created
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }
}

impl ProviderFactory for MachineFactory {
    fn check(&self, config: &MachineConfig) -> Result<()> {
        config.validate()?;
        if self.backend == Backend::Docker && config.origin != Origin::Source {
            return Err(Error::UnsupportedBackend {
                origin: config.origin.to_string(),
                backend: self.backend.to_string(),
            });
        }
        for release in &config.releases {
            InstallPlan::for_machine(config, release)?;
        }
        Ok(())
    }

    fn create(&self, config: &MachineConfig, release: &str) -> Result<Box<dyn MachineProvider>> {
        self.check(config)?;
        let plan = InstallPlan::for_machine(config, release)?;
        let provider: Box<dyn MachineProvider> = match (config.origin, self.backend) {
            (Origin::Source, Backend::Docker) => {
                Box::new(DockerProvider::new(config, release, plan, &self.timeouts))
            }
            (_, Backend::Lxd) => {
                Box::new(LxdProvider::new(config, release, plan, &self.timeouts))
            }
            (origin, backend) => {
                return Err(Error::UnsupportedBackend {
                    origin: origin.to_string(),
                    backend: backend.to_string(),
                })
            }
        };
        tracing::debug!(
            machine = %provider.machine(),
            backend = %self.backend,
            "Created machine"
        );
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{MachineState, Mode};

    #[test]
    fn test_docker_rejects_snap() {
        let factory = MachineFactory::new(Backend::Docker);
        let config = MachineConfig::new(Mode::Local, Origin::Snap, &["jammy"]);
        let err = factory.check(&config).unwrap_err();
        assert!(matches!(err, Error::UnsupportedBackend { .. }));
        assert!(err.is_configuration());
        assert!(factory.create(&config, "jammy").is_err());
    }

    #[test]
    fn test_selects_backend() {
        let source = MachineConfig::new(Mode::Local, Origin::Source, &["jammy"]).with_uri("/src");

        let docker = MachineFactory::new(Backend::Docker)
            .create(&source, "jammy")
            .unwrap();
        assert_eq!(docker.machine().backend, Backend::Docker);
        assert_eq!(docker.machine().state, MachineState::Created);

        let lxd = MachineFactory::new(Backend::Lxd)
            .create(&source, "jammy")
            .unwrap();
        assert_eq!(lxd.machine().backend, Backend::Lxd);

        let ppa = MachineConfig::new(Mode::Remote, Origin::Ppa, &["focal"]).with_uri("ppa:x/y");
        let machine = MachineFactory::new(Backend::Lxd).create(&ppa, "focal").unwrap();
        assert_eq!(machine.program_command("remote 1.2.3.4 l"), "checkbox-cli remote 1.2.3.4 l");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let factory = MachineFactory::new(Backend::Lxd);
        let config = MachineConfig::new(Mode::Local, Origin::Source, &["jammy"]);
        assert!(factory.check(&config).unwrap_err().is_configuration());

        let unknown_release = MachineConfig::new(Mode::Local, Origin::Snap, &["warty"]);
        assert!(factory.check(&unknown_release).unwrap_err().is_configuration());
    }
}
