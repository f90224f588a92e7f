// Live unit state from systemd over D-Bus

use crate::control::models::UnitState;
use crate::control::resilience::ConnectionManager;
use crate::error::Result;
use futures::future::BoxFuture;
use zbus::Connection;

/// Reads a unit's current state from its supervisor
#[cfg_attr(test, mockall::automock)]
pub trait StatusProbe: Send + Sync {
    /// None when the supervisor reports a state with no equivalent
    fn probe(&self, unit: &str) -> BoxFuture<'static, Result<Option<UnitState>>>;
}

/// Queries systemd's ActiveState for a unit
#[derive(Clone)]
pub struct SystemdProbe {
    connection: Connection,
}

impl SystemdProbe {
    pub async fn connect(manager: &ConnectionManager) -> Result<Self> {
        let connection = manager.connect_systemd().await?;
        Ok(Self { connection })
    }

    async fn active_state(connection: Connection, unit: String) -> Result<String> {
        let manager = zbus::Proxy::new(
            &connection,
            "org.freedesktop.systemd1",
            "/org/freedesktop/systemd1",
            "org.freedesktop.systemd1.Manager",
        )
        .await?;

        // LoadUnit also resolves units that are not currently loaded
        let unit_path: zbus::zvariant::OwnedObjectPath = manager
            .call("LoadUnit", &(unit.as_str(),))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load unit '{}': {}", unit, e))?;

        let unit_proxy = zbus::Proxy::new(
            &connection,
            "org.freedesktop.systemd1",
            unit_path.as_str(),
            "org.freedesktop.systemd1.Unit",
        )
        .await?;

        let active_state: String = unit_proxy
            .get_property("ActiveState")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read ActiveState of '{}': {}", unit, e))?;

        Ok(active_state)
    }
}

impl StatusProbe for SystemdProbe {
    fn probe(&self, unit: &str) -> BoxFuture<'static, Result<Option<UnitState>>> {
        let connection = self.connection.clone();
        let unit = unit.to_string();

        Box::pin(async move {
            let active_state = Self::active_state(connection, unit.clone()).await?;
            tracing::debug!("systemd reports {} as {}", unit, active_state);
            Ok(UnitState::from_active_state(&active_state))
        })
    }
}
