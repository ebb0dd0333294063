/**
 * ERREURS GRID - Taxonomie commune du coeur (cache, résolution, collecte, DNS)
 *
 * RÔLE :
 * Un seul type d'erreur traverse store → resolver → collector → sync → dns.
 * Chaque variante porte assez de contexte pour décider : on continue
 * (erreur locale à un hôte) ou on abandonne l'opération entière.
 *
 * RÈGLES :
 * - NotFound = cache miss, toujours récupérable (déclenche une collecte live)
 * - StoreUnavailable = infra cache HS, on dégrade en live-only si possible
 * - HostUnknown / CollectionFailed = erreurs par hôte, jamais fatales au batch
 * - InvalidProvider = erreur d'entrée client (HTTP 400), jamais un 500
 */

/// Erreurs possibles lors des opérations Grid
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error("cache store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("key '{key}' not found in bucket '{bucket}'")]
    NotFound { bucket: String, key: String },
    #[error("corrupt payload for '{key}' in bucket '{bucket}': {source}")]
    Corrupt {
        bucket: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown host: {0}")]
    HostUnknown(String),
    #[error("invalid provider: {0}")]
    InvalidProvider(String),
    #[error("collection failed for {host}: {reason}")]
    CollectionFailed { host: String, reason: String },
    #[error("provider {provider} failed: {message}")]
    Provider { provider: String, message: String },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Config(String),
}

pub type GridResult<T> = Result<T, GridError>;

impl GridError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        GridError::NotFound { bucket: bucket.to_string(), key: key.to_string() }
    }

    pub fn collection(host: &str, reason: impl ToString) -> Self {
        GridError::CollectionFailed { host: host.to_string(), reason: reason.to_string() }
    }

    pub fn provider(provider: &str, message: impl ToString) -> Self {
        GridError::Provider { provider: provider.to_string(), message: message.to_string() }
    }

    /// Vrai si l'erreur reste locale à un membre de la flotte (on continue le batch)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GridError::NotFound { .. }
                | GridError::HostUnknown(_)
                | GridError::CollectionFailed { .. }
                | GridError::Timeout(_)
        )
    }

    /// Code stable exposé dans les réponses JSON de l'API
    pub fn code(&self) -> &'static str {
        match self {
            GridError::StoreUnavailable(_) => "store_unavailable",
            GridError::NotFound { .. } => "not_found",
            GridError::Corrupt { .. } => "corrupt_payload",
            GridError::HostUnknown(_) => "host_unknown",
            GridError::InvalidProvider(_) => "invalid_provider",
            GridError::CollectionFailed { .. } => "collection_failed",
            GridError::Provider { .. } => "provider_error",
            GridError::Timeout(_) => "timeout",
            GridError::Config(_) => "config_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_split() {
        assert!(GridError::not_found("i2-vms", "alpha").is_recoverable());
        assert!(GridError::HostUnknown("alpha".into()).is_recoverable());
        assert!(GridError::collection("alpha", "ssh refused").is_recoverable());
        assert!(!GridError::StoreUnavailable("no connection".into()).is_recoverable());
        assert!(!GridError::InvalidProvider("azure".into()).is_recoverable());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = GridError::not_found("i2-containers", "beta");
        assert_eq!(err.to_string(), "key 'beta' not found in bucket 'i2-containers'");
        assert_eq!(err.code(), "not_found");
    }
}
