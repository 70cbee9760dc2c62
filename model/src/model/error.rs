use thiserror::Error;

/// Erreurs du réseau de capsules
#[derive(Debug, Error)]
pub enum CapsError {
    /// Combinaison de configuration invalide ou non supportée
    #[error("configuration invalide: {0}")]
    Config(String),

    /// Forme de tenseur inattendue (incohérence d'architecture)
    #[error("forme invalide pour {context}: attendu {expected:?}, obtenu {actual:?}")]
    Shape {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("label {label} hors limites pour {num_classes} classes")]
    LabelOutOfRange { label: usize, num_classes: usize },

    /// Sortie requise absente du dictionnaire de sorties
    #[error("sortie manquante: {0}")]
    MissingOutput(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CapsError>;

/// Vérifie qu'une forme correspond exactement à la forme attendue
pub fn ensure_shape(context: &str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(CapsError::Shape {
            context: context.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}
