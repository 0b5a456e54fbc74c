use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use nalgebra::{DMatrix, Matrix3};
use thiserror::Error;

/// Tolerancia para la verificación de simetría de las covarianzas
const SYMMETRY_TOL: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error on {path:?}: {source}")]
    Csv { path: PathBuf, source: csv::Error },

    #[error("malformed shape header in {path:?}")]
    MalformedShape { path: PathBuf },

    #[error("invalid float `{value}` in {path:?}")]
    BadValue { path: PathBuf, value: String },

    #[error("{path:?}: expected {expected} data rows, got {got}")]
    RowCount {
        path: PathBuf,
        expected: usize,
        got: usize,
    },

    #[error("model {name}: Mu has {mu_cols} time steps but Sigma has {sigma_slices} slices")]
    LengthMismatch {
        name: String,
        mu_cols: usize,
        sigma_slices: usize,
    },

    #[error("model {name}: covariance slice {slice} is not symmetric")]
    AsymmetricCovariance { name: String, slice: usize },

    #[error("model {name}: threshold must be positive, got {threshold}")]
    NonPositiveThreshold { name: String, threshold: f64 },

    #[error("model {name}: component weights must be non-negative")]
    NegativeWeight { name: String },
}

/// Descriptor estático de un modelo (sólo entrenamiento): nombre, número de
/// pruebas de modelado y número de gaussianas por componente.
#[derive(Debug, Clone)]
pub struct StaticModel {
    pub name: String,
    pub nb_trials: usize,
    pub nb_gravity_gaussians: usize,
    pub nb_body_gaussians: usize,
}

/// Modelo dinámico de una primitiva de movimiento: curva media y cubo de
/// covarianzas por componente (gravedad y aceleración corporal), pesos de
/// mezcla y umbral de distancia.
///
/// `gravity_mean`/`body_mean` tienen forma (4, L): fila 0 es el índice de
/// tiempo, filas 1..3 los ejes. Las covarianzas son L matrices 3×3.
#[derive(Debug, Clone)]
pub struct DynamicModel {
    pub name: String,
    /// número de puntos temporales del modelo
    pub size: usize,
    pub gravity_mean: DMatrix<f64>,
    pub gravity_cov: Vec<Matrix3<f64>>,
    pub body_mean: DMatrix<f64>,
    pub body_cov: Vec<Matrix3<f64>>,
    pub gravity_weight: f64,
    pub body_weight: f64,
    pub threshold: f64,
}

impl DynamicModel {
    /// Construye un modelo validando los invariantes de carga.
    pub fn new(
        name: impl Into<String>,
        gravity_mean: DMatrix<f64>,
        gravity_cov: Vec<Matrix3<f64>>,
        body_mean: DMatrix<f64>,
        body_cov: Vec<Matrix3<f64>>,
        gravity_weight: f64,
        body_weight: f64,
        threshold: f64,
    ) -> Result<Self, ModelError> {
        let name = name.into();

        if threshold <= 0.0 {
            return Err(ModelError::NonPositiveThreshold { name, threshold });
        }
        if gravity_weight < 0.0 || body_weight < 0.0 {
            return Err(ModelError::NegativeWeight { name });
        }

        let size = gravity_mean.ncols();
        for (mean, cov) in [(&gravity_mean, &gravity_cov), (&body_mean, &body_cov)] {
            if mean.ncols() != size || cov.len() != size {
                return Err(ModelError::LengthMismatch {
                    name: name.clone(),
                    mu_cols: mean.ncols(),
                    sigma_slices: cov.len(),
                });
            }
            for (s, sigma) in cov.iter().enumerate() {
                if !is_symmetric(sigma) {
                    return Err(ModelError::AsymmetricCovariance {
                        name: name.clone(),
                        slice: s,
                    });
                }
            }
        }

        Ok(Self {
            name,
            size,
            gravity_mean,
            gravity_cov,
            body_mean,
            body_cov,
            gravity_weight,
            body_weight,
            threshold,
        })
    }

    /// Carga un modelo desde los cuatro archivos `<name>{Mu,Sigma}{Gravity,Body}.txt`
    /// dentro de la carpeta del conjunto de datos.
    pub fn load(
        dataset_folder: &Path,
        name: &str,
        gravity_weight: f64,
        body_weight: f64,
        threshold: f64,
    ) -> Result<Self, ModelError> {
        let file = |kind: &str, component: &str| {
            dataset_folder.join(format!("{}{}{}.txt", name, kind, component))
        };

        let gravity_mean = load_mu(&file("Mu", "Gravity"))?;
        let gravity_cov = load_sigma(&file("Sigma", "Gravity"))?;
        let body_mean = load_mu(&file("Mu", "Body"))?;
        let body_cov = load_sigma(&file("Sigma", "Body"))?;

        Self::new(
            name,
            gravity_mean,
            gravity_cov,
            body_mean,
            body_cov,
            gravity_weight,
            body_weight,
            threshold,
        )
    }
}

fn is_symmetric(m: &Matrix3<f64>) -> bool {
    for i in 0..3 {
        for j in (i + 1)..3 {
            if (m[(i, j)] - m[(j, i)]).abs() > SYMMETRY_TOL {
                return false;
            }
        }
    }
    true
}

fn parse_float(path: &Path, field: &str) -> Result<f64, ModelError> {
    field.trim().parse::<f64>().map_err(|_| ModelError::BadValue {
        path: path.to_path_buf(),
        value: field.to_string(),
    })
}

fn parse_shape(path: &Path, field: &str) -> Result<usize, ModelError> {
    field
        .trim()
        .parse::<usize>()
        .map_err(|_| ModelError::MalformedShape {
            path: path.to_path_buf(),
        })
}

fn csv_records(path: &Path) -> Result<Vec<csv::StringRecord>, ModelError> {
    let file = File::open(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(file);

    let mut records = Vec::new();
    for record in reader.records() {
        records.push(record.map_err(|source| ModelError::Csv {
            path: path.to_path_buf(),
            source,
        })?);
    }
    Ok(records)
}

/// Carga una matriz Mu. El archivo empieza con `cols,rows` y sigue con
/// `rows` líneas CSV de `cols` flotantes (una línea por paso temporal);
/// la matriz devuelta queda transpuesta, con forma (cols, rows).
pub fn load_mu(path: &Path) -> Result<DMatrix<f64>, ModelError> {
    let records = csv_records(path)?;
    let header = records.first().ok_or_else(|| ModelError::MalformedShape {
        path: path.to_path_buf(),
    })?;
    if header.len() != 2 {
        return Err(ModelError::MalformedShape {
            path: path.to_path_buf(),
        });
    }
    let cols = parse_shape(path, &header[0])?;
    let rows = parse_shape(path, &header[1])?;

    if records.len() - 1 != rows {
        return Err(ModelError::RowCount {
            path: path.to_path_buf(),
            expected: rows,
            got: records.len() - 1,
        });
    }

    let mut mu = DMatrix::zeros(cols, rows);
    for (r, record) in records[1..].iter().enumerate() {
        if record.len() != cols {
            return Err(ModelError::MalformedShape {
                path: path.to_path_buf(),
            });
        }
        for (c, field) in record.iter().enumerate() {
            mu[(c, r)] = parse_float(path, field)?;
        }
    }

    Ok(mu)
}

/// Carga un cubo Sigma. El archivo empieza con `rows,cols,slices` y sigue
/// con `slices` bloques CSV de `rows` líneas con `cols` flotantes.
pub fn load_sigma(path: &Path) -> Result<Vec<Matrix3<f64>>, ModelError> {
    let records = csv_records(path)?;
    let header = records.first().ok_or_else(|| ModelError::MalformedShape {
        path: path.to_path_buf(),
    })?;
    if header.len() != 3 {
        return Err(ModelError::MalformedShape {
            path: path.to_path_buf(),
        });
    }
    let rows = parse_shape(path, &header[0])?;
    let cols = parse_shape(path, &header[1])?;
    let slices = parse_shape(path, &header[2])?;

    if rows != 3 || cols != 3 {
        return Err(ModelError::MalformedShape {
            path: path.to_path_buf(),
        });
    }
    if records.len() - 1 != rows * slices {
        return Err(ModelError::RowCount {
            path: path.to_path_buf(),
            expected: rows * slices,
            got: records.len() - 1,
        });
    }

    let mut cube = Vec::with_capacity(slices);
    for s in 0..slices {
        let mut slice = Matrix3::zeros();
        for r in 0..rows {
            let record = &records[1 + s * rows + r];
            if record.len() != cols {
                return Err(ModelError::MalformedShape {
                    path: path.to_path_buf(),
                });
            }
            for (c, field) in record.iter().enumerate() {
                slice[(r, c)] = parse_float(path, field)?;
            }
        }
        cube.push(slice);
    }

    Ok(cube)
}

/// Escribe una matriz Mu (4, L) en el formato documentado: cabecera
/// `cols,rows` y una línea por paso temporal.
pub fn save_mu(path: &Path, mu: &DMatrix<f64>) -> Result<(), ModelError> {
    let io_err = |source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(io_err)?;
    let mut out = BufWriter::new(file);

    writeln!(out, "{},{}", mu.nrows(), mu.ncols()).map_err(io_err)?;
    for step in 0..mu.ncols() {
        let line: Vec<String> = (0..mu.nrows()).map(|v| mu[(v, step)].to_string()).collect();
        writeln!(out, "{}", line.join(",")).map_err(io_err)?;
    }
    Ok(())
}

/// Escribe un cubo Sigma en el formato documentado: cabecera
/// `rows,cols,slices` y un bloque de 3 líneas por paso temporal.
pub fn save_sigma(path: &Path, cube: &[Matrix3<f64>]) -> Result<(), ModelError> {
    let io_err = |source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(io_err)?;
    let mut out = BufWriter::new(file);

    writeln!(out, "3,3,{}", cube.len()).map_err(io_err)?;
    for slice in cube {
        for r in 0..3 {
            writeln!(
                out,
                "{},{},{}",
                slice[(r, 0)],
                slice[(r, 1)],
                slice[(r, 2)]
            )
            .map_err(io_err)?;
        }
    }
    Ok(())
}
