use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nalgebra::DMatrix;

use crate::device::Device;
use crate::filters::{chebyshev_lowpass, create_interval, median_filter};
use crate::gmm::GaussianMixture;
use crate::model::{save_mu, save_sigma, StaticModel};
use crate::types::{MEDIAN_WINDOW, NUM_AXES};

/// Lee `HMPconfig.txt`: filas `nombre nbTrials nbGG nbBG` separadas por
/// blancos hasta el fin del archivo.
pub fn parse_training_config(path: &Path) -> Result<Vec<StaticModel>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("no se pudo leer la configuración de entrenamiento {:?}", path))?;
    let tokens: Vec<&str> = content.split_whitespace().collect();
    if tokens.len() % 4 != 0 {
        bail!(
            "{:?}: se esperaban filas de 4 campos, hay {} tokens",
            path,
            tokens.len()
        );
    }

    let mut motions = Vec::with_capacity(tokens.len() / 4);
    for row in tokens.chunks(4) {
        let parse_count = |field: &str, what: &str| -> Result<usize> {
            field
                .parse::<usize>()
                .with_context(|| format!("{} inválido para el modelo {}: {}", what, row[0], field))
        };
        motions.push(StaticModel {
            name: row[0].to_string(),
            nb_trials: parse_count(row[1], "número de pruebas")?,
            nb_gravity_gaussians: parse_count(row[2], "gaussianas de gravedad")?,
            nb_body_gaussians: parse_count(row[3], "gaussianas de cuerpo")?,
        });
    }
    Ok(motions)
}

/// Constructor de modelos dinámicos a partir de pruebas etiquetadas:
/// filtra las pruebas, ajusta una mezcla por componente y la regresa a una
/// curva media con covarianzas por instante.
pub struct Creator {
    dataset_folder: PathBuf,
    device: Device,
}

impl Creator {
    pub fn new(models_root: &Path, dataset: &str, device: Device) -> Self {
        Self {
            dataset_folder: models_root.join(dataset),
            device,
        }
    }

    pub fn dataset_folder(&self) -> &Path {
        &self.dataset_folder
    }

    /// Decodifica una prueba de modelado completa a una matriz (n × 3).
    fn load_trial(&self, path: &Path) -> Result<DMatrix<f64>> {
        let file =
            File::open(path).with_context(|| format!("no se pudo abrir la prueba {:?}", path))?;

        let mut rows = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("error leyendo {:?}", path))?;
            if line.trim().is_empty() {
                continue;
            }
            let sample = self
                .device
                .extract_actual(&line)
                .with_context(|| format!("línea {} ilegible en {:?}", idx + 1, path))?;
            rows.push(sample);
        }
        if rows.is_empty() {
            bail!("la prueba {:?} no contiene muestras", path);
        }

        Ok(DMatrix::from_fn(rows.len(), NUM_AXES, |r, c| rows[r][c]))
    }

    /// Extrae y concatena los conjuntos de gravedad y cuerpo de todas las
    /// pruebas de un movimiento. Cada fila lleva antepuesta su columna de
    /// tiempo 1..n (por prueba).
    fn get_features(&self, name: &str, nb_trials: usize) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
        let mut gravity_rows: Vec<[f64; 4]> = Vec::new();
        let mut body_rows: Vec<[f64; 4]> = Vec::new();

        for k in 1..=nb_trials {
            let path = self.dataset_folder.join(name).join(format!("mod ({}).txt", k));
            println!("[HMP] Abriendo prueba de modelado: {}", path.display());
            let set = self.load_trial(&path)?;
            let n = set.nrows();

            // limpieza por mediana sobre (3 × n)
            let mut clean = set.transpose();
            median_filter(&mut clean, MEDIAN_WINDOW)?;

            // separación gravedad / cuerpo por pasa-bajos
            let mut gravity_t = clean.clone();
            chebyshev_lowpass(&mut gravity_t);

            let clean_n = clean.transpose();
            let gravity = gravity_t.transpose();
            let body = &clean_n - &gravity;

            let time = create_interval(1, n as i64);
            for r in 0..n {
                gravity_rows.push([time[(r, 0)], gravity[(r, 0)], gravity[(r, 1)], gravity[(r, 2)]]);
                body_rows.push([time[(r, 0)], body[(r, 0)], body[(r, 1)], body[(r, 2)]]);
            }
        }

        let to_matrix = |rows: &[[f64; 4]]| DMatrix::from_fn(rows.len(), 4, |r, c| rows[r][c]);
        Ok((to_matrix(&gravity_rows), to_matrix(&body_rows)))
    }

    /// Ajusta y persiste una componente (gravedad o cuerpo): mezcla por EM,
    /// parámetros en JSON y regresión a `Mu`/`Sigma`.
    fn fit_component(
        &self,
        name: &str,
        component: &str,
        nb_gaussians: usize,
        data: &DMatrix<f64>,
        nb_data: usize,
    ) -> Result<()> {
        let mut mixture = GaussianMixture::init_time_split(nb_gaussians, data)?;
        let iterations = mixture.run_em(data)?;
        println!("[HMP] {}{}: EM en {} iteraciones", name, component, iterations);

        let lower = component.to_lowercase();
        mixture.save_params(&self.dataset_folder.join(format!("{}GMM{}.json", name, lower)))?;

        let grid = create_interval(1, nb_data as i64);
        let regression = mixture.regression(&grid)?;

        save_mu(
            &self.dataset_folder.join(format!("{}Mu{}.txt", name, component)),
            &regression.mean,
        )?;
        save_sigma(
            &self
                .dataset_folder
                .join(format!("{}Sigma{}.txt", name, component)),
            &regression.covariances,
        )?;
        Ok(())
    }

    /// Crea el modelo de una primitiva de movimiento con GMM+GMR.
    pub fn generate_model(&self, motion: &StaticModel) -> Result<()> {
        if motion.nb_trials == 0 {
            bail!("el modelo {} no tiene pruebas de modelado", motion.name);
        }

        println!("[HMP] Creando los conjuntos de gravedad y cuerpo: {}", motion.name);
        let (tot_gravity, tot_body) = self.get_features(&motion.name, motion.nb_trials)?;

        // longitud del modelo: muestras por prueba (las pruebas se asumen
        // de duración comparable)
        let nb_data = tot_gravity.nrows() / motion.nb_trials;
        println!("[HMP] Muestras por prueba de modelado: {}", nb_data);

        self.fit_component(
            &motion.name,
            "Gravity",
            motion.nb_gravity_gaussians,
            &tot_gravity,
            nb_data,
        )?;
        self.fit_component(
            &motion.name,
            "Body",
            motion.nb_body_gaussians,
            &tot_body,
            nb_data,
        )?;
        Ok(())
    }

    /// Crea los modelos de todas las primitivas listadas en `HMPconfig.txt`.
    /// Un error de entrenamiento es fatal sólo para ese movimiento.
    pub fn generate_all_models(&self) -> Result<()> {
        let motions = parse_training_config(&self.dataset_folder.join("HMPconfig.txt"))?;
        for motion in &motions {
            if let Err(e) = self.generate_model(motion) {
                eprintln!("[HMP] Error generando el modelo {}: {:#}", motion.name, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DynamicModel;

    #[test]
    fn test_parse_training_config() {
        let dir = std::env::temp_dir().join("brazalete_hmpconfig");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("HMPconfig.txt");
        std::fs::write(&path, "drink 5 4 6\nsit 3 2 2\n").unwrap();

        let motions = parse_training_config(&path).unwrap();
        assert_eq!(motions.len(), 2);
        assert_eq!(motions[0].name, "drink");
        assert_eq!(motions[0].nb_trials, 5);
        assert_eq!(motions[1].nb_body_gaussians, 2);

        std::fs::write(&path, "drink 5 4\n").unwrap();
        assert!(parse_training_config(&path).is_err());
    }

    /// Escribe una prueba sintética en el formato del dispositivo: una
    /// rampa lenta en x, un nivel en z, ruido determinista pequeño.
    fn write_trial(path: &Path, samples: usize, phase: usize) {
        let mut content = String::new();
        for i in 0..samples {
            let ax = (i * 40) as i64 + ((i * 7 + phase * 3) % 11) as i64;
            let ay = ((i * 13 + phase) % 17) as i64;
            let az = 16000 + ((i + phase) % 5) as i64;
            content.push_str(&format!("1 {} {} {} 0 0 0 0\n", ax, ay, az));
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_generate_model_end_to_end() {
        let root = std::env::temp_dir().join("brazalete_creator");
        let dataset = root.join("demo");
        let motion_dir = dataset.join("wave");
        std::fs::create_dir_all(&motion_dir).unwrap();

        let samples = 50;
        write_trial(&motion_dir.join("mod (1).txt"), samples, 0);
        write_trial(&motion_dir.join("mod (2).txt"), samples, 1);

        let creator = Creator::new(&root, "demo", Device::Mpu6050);
        let motion = StaticModel {
            name: "wave".to_string(),
            nb_trials: 2,
            nb_gravity_gaussians: 2,
            nb_body_gaussians: 2,
        };
        creator.generate_model(&motion).unwrap();

        for file in [
            "waveMuGravity.txt",
            "waveSigmaGravity.txt",
            "waveMuBody.txt",
            "waveSigmaBody.txt",
            "waveGMMgravity.json",
            "waveGMMbody.json",
        ] {
            assert!(dataset.join(file).exists(), "missing {}", file);
        }

        // el modelo persistido cumple los invariantes de carga y su
        // longitud es el número de muestras por prueba
        let model = DynamicModel::load(&dataset, "wave", 0.5, 0.5, 10.0).unwrap();
        assert_eq!(model.size, samples);
        assert_eq!(model.gravity_mean[(0, 0)], 1.0);
        assert_eq!(model.gravity_mean[(0, samples - 1)], samples as f64);
    }

    #[test]
    fn test_missing_trial_is_fatal_for_motion() {
        let root = std::env::temp_dir().join("brazalete_creator_missing");
        std::fs::create_dir_all(root.join("demo")).unwrap();
        let creator = Creator::new(&root, "demo", Device::Mpu6050);
        let motion = StaticModel {
            name: "ghost".to_string(),
            nb_trials: 1,
            nb_gravity_gaussians: 2,
            nb_body_gaussians: 2,
        };
        assert!(creator.generate_model(&motion).is_err());
    }
}
