use std::sync::Arc;

use satgate::{AnyBackend, LnbitsBackend, MockBackend, TokenDefaults, TokenService};

use crate::config::{ConfigError, GatewayConfig, LightningBackendKind, MeterBackendKind};
use crate::meter::Meter;
use crate::metrics::METER_FALLBACKS;

/// Shared per-process state, cloned into every worker.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub tokens: Arc<TokenService>,
    pub meter: Arc<Meter>,
    pub lightning: Arc<AnyBackend>,
}

impl AppState {
    /// Wire up the token service, meter, and payment backend from a compiled
    /// config. A sqlite meter that cannot open degrades to the in-process
    /// store at startup, same as a runtime store failure would.
    pub fn from_config(config: GatewayConfig) -> Result<Self, ConfigError> {
        let tokens = TokenService::new(
            config.root_key,
            TokenDefaults {
                ttl_secs: config.l402.default_ttl_secs,
                max_delegation_depth: config.l402.max_delegation_depth,
            },
        );

        let meter = match Meter::new(config.meter_backend, &config.meter_db_path) {
            Ok(meter) => meter,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    db_path = %config.meter_db_path,
                    "meter store unavailable at startup, using the in-process store"
                );
                METER_FALLBACKS.inc();
                Meter::in_memory()
            }
        };
        if config.meter_backend == MeterBackendKind::Sqlite {
            tracing::info!(db_path = %config.meter_db_path, "metering via sqlite");
        }

        let lightning = match config.lightning_backend {
            LightningBackendKind::Mock => AnyBackend::Mock(MockBackend::new()),
            LightningBackendKind::Lnbits => {
                // compile() already guaranteed both are present for lnbits.
                let url = config.lnbits_url.clone().unwrap_or_default();
                let key = config.lnbits_api_key.clone().unwrap_or_default();
                let backend = LnbitsBackend::new(&url, &key).map_err(|e| {
                    ConfigError::Invalid(vec![format!("lnbits backend: {e}")])
                })?;
                AnyBackend::Lnbits(backend)
            }
        };

        Ok(Self {
            config: Arc::new(config),
            tokens: Arc::new(tokens),
            meter: Arc::new(meter),
            lightning: Arc::new(lightning),
        })
    }
}
