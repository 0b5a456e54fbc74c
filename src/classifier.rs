use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use nalgebra::{DMatrix, Vector3};
use thiserror::Error;

use crate::device::Device;
use crate::filters::{chebyshev_lowpass, median_filter, FilterError};
use crate::model::{DynamicModel, ModelError};
use crate::publisher::{Publisher, PublisherError};
use crate::types::{Sample, MEDIAN_WINDOW, NUM_AXES};

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("publisher error: {0}")]
    Publisher(#[from] PublisherError),

    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed config {path:?}: {reason}")]
    Config { path: PathBuf, reason: String },
}

/// Raíces de los directorios de trabajo. El binario usa los valores
/// relativos clásicos; las pruebas y otros integradores pasan rutas propias.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    pub models_root: PathBuf,
    pub validation_root: PathBuf,
    pub results_root: PathBuf,
}

impl Default for DatasetLayout {
    fn default() -> Self {
        Self {
            models_root: PathBuf::from("./Models"),
            validation_root: PathBuf::from("./Validation"),
            results_root: PathBuf::from("./Results"),
        }
    }
}

/// Una entrada de `Classifierconfig.txt`: nombre del modelo, pesos de los
/// componentes y umbral de distancia.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub name: String,
    pub gravity_weight: f64,
    pub body_weight: f64,
    pub threshold: f64,
}

/// Lee `Classifierconfig.txt`: el primer token es el número de modelos,
/// seguido de `nombre wg wb umbral` por modelo, separados por blancos.
pub fn parse_classifier_config(path: &Path) -> Result<Vec<ModelSpec>, ClassifierError> {
    let content = fs::read_to_string(path).map_err(|source| ClassifierError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tokens = content.split_whitespace();

    let config_err = |reason: String| ClassifierError::Config {
        path: path.to_path_buf(),
        reason,
    };

    let nb_models: usize = tokens
        .next()
        .ok_or_else(|| config_err("empty file".into()))?
        .parse()
        .map_err(|_| config_err("model count is not an integer".into()))?;
    if nb_models == 0 {
        return Err(config_err("model count is zero".into()));
    }

    let mut specs = Vec::with_capacity(nb_models);
    for i in 0..nb_models {
        let name = tokens
            .next()
            .ok_or_else(|| config_err(format!("missing name for model {}", i + 1)))?
            .to_string();
        let mut float = |what: &str| -> Result<f64, ClassifierError> {
            tokens
                .next()
                .ok_or_else(|| config_err(format!("missing {} for model {}", what, name)))?
                .parse()
                .map_err(|_| config_err(format!("invalid {} for model {}", what, name)))
        };
        let gravity_weight = float("gravity weight")?;
        let body_weight = float("body weight")?;
        let threshold = float("threshold")?;
        specs.push(ModelSpec {
            name,
            gravity_weight,
            body_weight,
            threshold,
        });
    }

    Ok(specs)
}

/// Clasificador de primitivas de movimiento sobre una ventana deslizante.
///
/// Es el único dueño del conjunto de modelos dinámicos y de la ventana de
/// muestras; el resto del sistema sólo observa los vectores de posibilidad.
pub struct Classifier {
    layout: DatasetLayout,
    device: Device,
    publisher: Publisher,
    models: Vec<DynamicModel>,
    window: VecDeque<Sample>,
    window_size: usize,
    n_written: u64,
}

impl Classifier {
    /// Crea el clasificador leyendo `Classifierconfig.txt` del conjunto de
    /// datos y cargando cada modelo dinámico. Cualquier error de
    /// configuración es fatal: no se entra al lazo de muestras.
    pub fn new(
        layout: DatasetLayout,
        dataset: &str,
        device: Device,
        publisher: Publisher,
    ) -> Result<Self, ClassifierError> {
        let dataset_folder = layout.models_root.join(dataset);
        let specs = parse_classifier_config(&dataset_folder.join("Classifierconfig.txt"))?;

        let mut models = Vec::with_capacity(specs.len());
        for spec in &specs {
            let model = DynamicModel::load(
                &dataset_folder,
                &spec.name,
                spec.gravity_weight,
                spec.body_weight,
                spec.threshold,
            )?;
            println!("[HMP] Modelo cargado: {} (L={})", model.name, model.size);
            models.push(model);
        }

        Self::from_models(layout, models, device, publisher)
    }

    /// Crea el clasificador a partir de modelos ya construidos.
    pub fn from_models(
        layout: DatasetLayout,
        models: Vec<DynamicModel>,
        device: Device,
        publisher: Publisher,
    ) -> Result<Self, ClassifierError> {
        if models.is_empty() {
            return Err(ClassifierError::Config {
                path: layout.models_root.clone(),
                reason: "no models loaded".into(),
            });
        }

        // la ventana cubre el modelo más largo
        let window_size = models.iter().map(|m| m.size).max().unwrap_or(0);
        println!("[HMP] Tamaño de ventana: {}", window_size);

        let classifier = Self {
            layout,
            device,
            publisher,
            models,
            window: VecDeque::with_capacity(window_size),
            window_size,
            n_written: 0,
        };
        classifier.publish_static()?;
        Ok(classifier)
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn nb_models(&self) -> usize {
        self.models.len()
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models.iter().map(|m| m.name.clone()).collect()
    }

    /// La ventana está caliente cuando contiene `window_size` muestras.
    pub fn is_warm(&self) -> bool {
        self.n_written >= self.window_size as u64
    }

    /// Número total de muestras recibidas desde el arranque.
    pub fn samples_seen(&self) -> u64 {
        self.n_written
    }

    pub fn window(&self) -> &VecDeque<Sample> {
        &self.window
    }

    /// Imprime la configuración de cada modelo cargado.
    pub fn print_set_info(&self) {
        for m in &self.models {
            println!(
                "[HMP] {}: L={} wg={} wb={} umbral={}",
                m.name, m.size, m.gravity_weight, m.body_weight, m.threshold
            );
        }
    }

    /// Vacía la ventana para empezar un análisis desde cero.
    pub fn reset_window(&mut self) {
        self.window.clear();
        self.n_written = 0;
    }

    /// Incorpora una muestra a la ventana FIFO: crece hasta `window_size` y
    /// luego cada muestra nueva desaloja la más antigua.
    pub fn create_window(&mut self, sample: Sample) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        self.n_written += 1;
    }

    /// Separa la ventana en componente de gravedad y de aceleración
    /// corporal: mediana por eje para limpiar ruido y pasa-bajos Chebyshev
    /// para quedarse con la gravedad; el cuerpo es el residuo.
    ///
    /// Devuelve matrices (window_size × 3) tales que
    /// `gravedad + cuerpo == ventana_filtrada` en cada posición.
    pub fn analyze_window(&self) -> Result<(DMatrix<f64>, DMatrix<f64>), ClassifierError> {
        let w = self.window.len();
        let mut clean = DMatrix::zeros(NUM_AXES, w);
        for (i, sample) in self.window.iter().enumerate() {
            for axis in 0..NUM_AXES {
                clean[(axis, i)] = sample[axis];
            }
        }

        median_filter(&mut clean, MEDIAN_WINDOW)?;

        let mut gravity_t = clean.clone();
        chebyshev_lowpass(&mut gravity_t);

        let clean_w = clean.transpose();
        let gravity = gravity_t.transpose();
        let body = &clean_w - &gravity;
        Ok((gravity, body))
    }

    /// Distancia de Mahalanobis punto-a-punto en el índice `i`.
    ///
    /// `None` si la covarianza es singular o la distancia no es finita; el
    /// llamador degrada ese índice a aporte nulo.
    fn mahalanobis_dist(
        i: usize,
        trial: &DMatrix<f64>,
        mean: &DMatrix<f64>,
        covariances: &[nalgebra::Matrix3<f64>],
    ) -> Option<f64> {
        let diff = Vector3::new(
            trial[(0, i)] - mean[(0, i)],
            trial[(1, i)] - mean[(1, i)],
            trial[(2, i)] - mean[(2, i)],
        );
        let inverse = covariances[i].try_inverse()?;
        let d = (diff.transpose() * inverse * diff)[(0, 0)];
        d.is_finite().then_some(d)
    }

    /// Distancia global entre la ventana y un modelo: media de las
    /// distancias por índice de cada componente, combinada con los pesos
    /// del modelo. Devuelve además cuántos índices se degradaron por
    /// problemas numéricos.
    pub fn compare_one(
        &self,
        gravity: &DMatrix<f64>,
        body: &DMatrix<f64>,
        model: &DynamicModel,
    ) -> (f64, usize) {
        let len = model.size;

        // sub-ventana del tamaño del modelo, transpuesta a (3, L)
        let trial_g = gravity.rows(0, len).transpose();
        let trial_b = body.rows(0, len).transpose();

        // se descarta la fila de tiempo de las medias del modelo
        let ref_g = model.gravity_mean.rows(1, NUM_AXES).into_owned();
        let ref_b = model.body_mean.rows(1, NUM_AXES).into_owned();

        let mut sum_g = 0.0;
        let mut sum_b = 0.0;
        let mut degraded = 0;
        for i in 0..len {
            match Self::mahalanobis_dist(i, &trial_g, &ref_g, &model.gravity_cov) {
                Some(d) => sum_g += d,
                None => degraded += 1,
            }
            match Self::mahalanobis_dist(i, &trial_b, &ref_b, &model.body_cov) {
                Some(d) => sum_b += d,
                None => degraded += 1,
            }
        }

        let mean_g = sum_g / len as f64;
        let mean_b = sum_b / len as f64;
        let overall = model.gravity_weight * mean_g + model.body_weight * mean_b;
        (overall, degraded)
    }

    /// Posibilidad de cada modelo para la ventana actual:
    /// `max(0, 1 - distancia / umbral)`.
    pub fn compare_all(
        &self,
        gravity: &DMatrix<f64>,
        body: &DMatrix<f64>,
    ) -> Result<Vec<f64>, ClassifierError> {
        let mut possibilities = Vec::with_capacity(self.models.len());
        for model in &self.models {
            let (distance, degraded) = self.compare_one(gravity, body, model);
            if degraded > 0 {
                self.publisher.publish(
                    "warning",
                    &format!(
                        "covarianza singular o distancia no finita: {} ({} indices)",
                        model.name, degraded
                    ),
                )?;
            }
            possibilities.push((1.0 - distance / model.threshold).max(0.0));
        }
        Ok(possibilities)
    }

    /// Procesa una muestra: actualiza la ventana y, si ya está caliente,
    /// devuelve el vector de posibilidades de esta posición.
    pub fn process_sample(&mut self, sample: Sample) -> Result<Option<Vec<f64>>, ClassifierError> {
        self.create_window(sample);
        if !self.is_warm() {
            return Ok(None);
        }
        let (gravity, body) = self.analyze_window()?;
        Ok(Some(self.compare_all(&gravity, &body)?))
    }

    /// Publica la información estática: número y nombres de los modelos.
    pub fn publish_static(&self) -> Result<(), ClassifierError> {
        self.publisher
            .publish("numModels", &self.models.len().to_string())?;
        let names: Vec<&str> = self.models.iter().map(|m| m.name.as_str()).collect();
        self.publisher.publish("nameModels", &names.join(" "))?;
        Ok(())
    }

    /// Publica los resultados de reconocimiento de una ventana:
    /// `possibilities`, `highest`, `other` y `entropy`.
    pub fn publish_dynamic(&self, possibilities: &[f64]) -> Result<(), ClassifierError> {
        let joined: Vec<String> = possibilities.iter().map(|p| p.to_string()).collect();
        self.publisher.publish("possibilities", &joined.join(" "))?;

        let (best, second) = best_and_second(possibilities);

        let highest = match best {
            Some(b) => self.models[b].name.clone(),
            None => "NONE".to_string(),
        };
        self.publisher.publish("highest", &highest)?;

        let other = match best {
            Some(b) => 1.0 - possibilities[b],
            None => 1.0,
        };
        self.publisher.publish("other", &other.to_string())?;

        let entropy = match (best, second) {
            (None, _) => -1.0,
            (Some(b), None) => possibilities[b],
            (Some(b), Some(s)) => possibilities[b] - possibilities[s],
        };
        self.publisher.publish("entropy", &entropy.to_string())?;

        Ok(())
    }

    /// Clasifica un archivo grabado: una línea de posibilidades por ventana
    /// caliente en el archivo de resultados.
    pub fn single_test(&mut self, test_file: &Path, result_file: &Path) -> Result<(), ClassifierError> {
        self.reset_window();

        let input = File::open(test_file).map_err(|source| ClassifierError::Io {
            path: test_file.to_path_buf(),
            source,
        })?;

        if let Some(parent) = result_file.parent() {
            fs::create_dir_all(parent).map_err(|source| ClassifierError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let out_err = |source| ClassifierError::Io {
            path: result_file.to_path_buf(),
            source,
        };
        let mut output = BufWriter::new(File::create(result_file).map_err(out_err)?);

        println!("[HMP] Leyendo prueba: {}", test_file.display());
        for line in BufReader::new(input).lines() {
            let line = line.map_err(|source| ClassifierError::Io {
                path: test_file.to_path_buf(),
                source,
            })?;
            let sample = match self.device.extract_actual(&line) {
                Ok(sample) => sample,
                Err(e) => {
                    // muestra ilegible: se descarta sin avanzar contadores
                    eprintln!("[HMP] Línea descartada: {}", e);
                    continue;
                }
            };

            if let Some(possibilities) = self.process_sample(sample)? {
                let fields: Vec<String> = possibilities.iter().map(|p| p.to_string()).collect();
                writeln!(output, "{}", fields.join(" ")).map_err(out_err)?;
            }
        }

        Ok(())
    }

    /// Valida un modelo con `n` pruebas enumeradas del conjunto de
    /// validación: `<model>_test (k).txt` para k en 1..=n.
    pub fn validate_model(
        &mut self,
        model: &str,
        dataset: &str,
        trials: usize,
    ) -> Result<(), ClassifierError> {
        for k in 1..=trials {
            let trial = format!("{}_test ({}).txt", model, k);
            let test_file = self.layout.validation_root.join(dataset).join(&trial);
            let result_file = self
                .layout
                .results_root
                .join(dataset)
                .join(format!("res_{}", trial));
            self.single_test(&test_file, &result_file)?;
        }
        Ok(())
    }

    /// Clasifica una grabación larga de `Validation/longTest/`.
    pub fn long_test(&mut self, trial: &str) -> Result<(), ClassifierError> {
        let test_file = self.layout.validation_root.join("longTest").join(trial);
        let result_file = self
            .layout
            .results_root
            .join("longTest")
            .join(format!("res_{}", trial));
        self.single_test(&test_file, &result_file)
    }
}

/// Índices del mejor y el segundo mejor modelo. Los empates se resuelven a
/// favor del índice más bajo; un mejor con posibilidad 0 no cuenta.
fn best_and_second(possibilities: &[f64]) -> (Option<usize>, Option<usize>) {
    let mut best: Option<usize> = None;
    for (i, &p) in possibilities.iter().enumerate() {
        if best.map_or(true, |b| p > possibilities[b]) {
            best = Some(i);
        }
    }
    let best = best.filter(|&b| possibilities[b] > 0.0);

    let best_idx = match best {
        Some(b) => b,
        None => return (None, None),
    };

    let mut second: Option<usize> = None;
    for (i, &p) in possibilities.iter().enumerate() {
        if i == best_idx {
            continue;
        }
        if second.map_or(true, |s| p > possibilities[s]) {
            second = Some(i);
        }
    }
    let second = second.filter(|&s| possibilities[s] > 0.0);

    (best, second)
}
