use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crossbeam_channel::Sender;
use thiserror::Error;

/// Prefijo de espacio de nombres que el backend de tuplas antepone a las
/// claves del clasificador
pub const CLASSIFIER_NAMESPACE: &str = "HMPdetector.";

#[derive(Error, Debug)]
pub enum PublisherError {
    #[error("IO error on log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("tuple channel disconnected")]
    Disconnected,
}

/// Backends de publicación de pares (clave, valor).
///
/// El despacho es estático: el backend se elige al configurar el sistema y
/// no cambia durante la ejecución.
#[derive(Clone)]
pub enum Publisher {
    /// Archivo de registro en modo append (una línea `clave valor` por par)
    LogFile { path: PathBuf },
    /// Espacio de tuplas en proceso: las tuplas se envían por un canal y el
    /// consumidor decide qué hacer con ellas
    TupleSpace {
        namespace: String,
        tx: Sender<(String, String)>,
    },
}

impl Publisher {
    pub fn log_file(path: impl Into<PathBuf>) -> Self {
        Publisher::LogFile { path: path.into() }
    }

    pub fn tuple_space(tx: Sender<(String, String)>) -> Self {
        Publisher::TupleSpace {
            namespace: CLASSIFIER_NAMESPACE.to_string(),
            tx,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Publisher::LogFile { path } => format!("LogFile ({})", path.display()),
            Publisher::TupleSpace { namespace, .. } => format!("TupleSpace ({}*)", namespace),
        }
    }

    /// Publica un par (clave, valor) dentro del espacio de nombres del
    /// clasificador.
    pub fn publish(&self, key: &str, value: &str) -> Result<(), PublisherError> {
        match self {
            Publisher::LogFile { .. } => self.emit(key, value),
            Publisher::TupleSpace { namespace, .. } => {
                let key = format!("{}{}", namespace, key);
                self.emit(&key, value)
            }
        }
    }

    /// Publica un par cuya clave ya está completamente calificada
    /// (por ejemplo `Bracelet.HMP.drink`).
    pub fn publish_global(&self, key: &str, value: &str) -> Result<(), PublisherError> {
        self.emit(key, value)
    }

    fn emit(&self, key: &str, value: &str) -> Result<(), PublisherError> {
        match self {
            Publisher::LogFile { path } => {
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                writeln!(file, "{} {}", key, value)?;
                Ok(())
            }
            Publisher::TupleSpace { tx, .. } => tx
                .send((key.to_string(), value.to_string()))
                .map_err(|_| PublisherError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_tuple_space_applies_namespace() {
        let (tx, rx) = unbounded();
        let publisher = Publisher::tuple_space(tx);

        publisher.publish("numModels", "3").unwrap();
        let (key, value) = rx.try_recv().unwrap();
        assert_eq!(key, "HMPdetector.numModels");
        assert_eq!(value, "3");
    }

    #[test]
    fn test_publish_global_keeps_key() {
        let (tx, rx) = unbounded();
        let publisher = Publisher::tuple_space(tx);

        publisher.publish_global("Bracelet.HMP.drink", "0.9").unwrap();
        let (key, _) = rx.try_recv().unwrap();
        assert_eq!(key, "Bracelet.HMP.drink");
    }

    #[test]
    fn test_log_file_appends() {
        let path = std::env::temp_dir().join("brazalete_pub_test.log");
        let _ = std::fs::remove_file(&path);

        let publisher = Publisher::log_file(&path);
        publisher.publish("possibilities", "0.1 0.2").unwrap();
        publisher.publish("highest", "drink").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "possibilities 0.1 0.2\nhighest drink\n");
        let _ = std::fs::remove_file(&path);
    }
}
