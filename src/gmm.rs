use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use nalgebra::{Cholesky, DMatrix, DVector, Dyn, Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{EM_CONVERGENCE_TOL, MAX_EM_ITERATIONS};

/// Regularización diagonal para mantener las covarianzas definidas positivas
const COVARIANCE_RIDGE: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum GmmError {
    #[error("not enough data: {n} rows for {k} components")]
    NotEnoughData { n: usize, k: usize },

    #[error("regression requires 4 variables (time + 3 axes), got {0}")]
    Dimension(usize),

    #[error("component {0} covariance stayed singular after regularization")]
    Singular(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parámetros de una mezcla ajustada, en forma plana para persistencia
#[derive(Debug, Serialize, Deserialize)]
pub struct MixtureParams {
    pub nb_states: usize,
    pub nb_vars: usize,
    pub priors: Vec<f64>,
    /// una fila por componente, `nb_vars` valores
    pub means: Vec<Vec<f64>>,
    /// una matriz `nb_vars × nb_vars` por componente, por filas
    pub covariances: Vec<Vec<Vec<f64>>>,
}

/// Resultado de la regresión: curva media (nb_vars × T, fila 0 = tiempo) y
/// una covarianza 3×3 de salida por punto de la rejilla.
#[derive(Debug, Clone)]
pub struct Regression {
    pub mean: DMatrix<f64>,
    pub covariances: Vec<Matrix3<f64>>,
}

/// Mezcla de gaussianas multivariadas sobre datos (tiempo, ejes).
///
/// Los datos se organizan con filas = observaciones y columnas = variables;
/// la columna 0 es siempre el índice temporal.
#[derive(Debug, Clone)]
pub struct GaussianMixture {
    priors: Vec<f64>,
    means: Vec<DVector<f64>>,
    covariances: Vec<DMatrix<f64>>,
    nb_vars: usize,
}

impl GaussianMixture {
    /// Inicializa la mezcla partiendo el eje temporal en `nb_states`
    /// segmentos de igual ocupación: cada segmento aporta el prior, la media
    /// y la covarianza iniciales de un componente.
    pub fn init_time_split(nb_states: usize, data: &DMatrix<f64>) -> Result<Self, GmmError> {
        let n = data.nrows();
        let nb_vars = data.ncols();
        if nb_states == 0 || n < nb_states || nb_vars < 2 {
            return Err(GmmError::NotEnoughData { n, k: nb_states });
        }

        // índices de observación ordenados por tiempo
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            data[(a, 0)]
                .partial_cmp(&data[(b, 0)])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut priors = Vec::with_capacity(nb_states);
        let mut means = Vec::with_capacity(nb_states);
        let mut covariances = Vec::with_capacity(nb_states);

        for k in 0..nb_states {
            let lo = k * n / nb_states;
            let hi = (k + 1) * n / nb_states;
            let members = &order[lo..hi];

            let mut mean = DVector::zeros(nb_vars);
            for &i in members {
                for v in 0..nb_vars {
                    mean[v] += data[(i, v)];
                }
            }
            mean /= members.len() as f64;

            let mut cov = DMatrix::zeros(nb_vars, nb_vars);
            for &i in members {
                let diff = DVector::from_fn(nb_vars, |v, _| data[(i, v)] - mean[v]);
                cov += &diff * diff.transpose();
            }
            cov /= members.len() as f64;
            for v in 0..nb_vars {
                cov[(v, v)] += COVARIANCE_RIDGE;
            }

            priors.push(members.len() as f64 / n as f64);
            means.push(mean);
            covariances.push(cov);
        }

        Ok(Self {
            priors,
            means,
            covariances,
            nb_vars,
        })
    }

    pub fn nb_states(&self) -> usize {
        self.priors.len()
    }

    /// Refina la mezcla por expectation-maximization hasta que la
    /// log-verosimilitud media se estabiliza o se alcanza el tope de
    /// iteraciones (el tope se acepta como éxito con el mejor ajuste).
    ///
    /// Devuelve el número de iteraciones ejecutadas.
    pub fn run_em(&mut self, data: &DMatrix<f64>) -> Result<usize, GmmError> {
        let n = data.nrows();
        let k = self.nb_states();
        if n < k {
            return Err(GmmError::NotEnoughData { n, k });
        }

        let mut responsibilities = DMatrix::zeros(n, k);
        let mut previous_ll = f64::NEG_INFINITY;

        for iteration in 0..MAX_EM_ITERATIONS {
            // paso E
            let factors: Vec<CholeskyFactor> = (0..k)
                .map(|j| CholeskyFactor::of(&mut self.covariances[j], j))
                .collect::<Result<_, _>>()?;

            let mut log_likelihood = 0.0;
            for i in 0..n {
                let x = DVector::from_fn(self.nb_vars, |v, _| data[(i, v)]);
                let mut total = 0.0;
                for j in 0..k {
                    let w = self.priors[j] * factors[j].pdf(&self.means[j], &x);
                    responsibilities[(i, j)] = w;
                    total += w;
                }
                if total > 0.0 {
                    for j in 0..k {
                        responsibilities[(i, j)] /= total;
                    }
                    log_likelihood += total.ln();
                } else {
                    // punto fuera del soporte numérico de todos los
                    // componentes: responsabilidad uniforme
                    for j in 0..k {
                        responsibilities[(i, j)] = 1.0 / k as f64;
                    }
                    log_likelihood += f64::MIN_POSITIVE.ln();
                }
            }

            // paso M
            for j in 0..k {
                let weight: f64 = (0..n).map(|i| responsibilities[(i, j)]).sum();
                if weight <= 0.0 {
                    continue;
                }

                let mut mean = DVector::zeros(self.nb_vars);
                for i in 0..n {
                    for v in 0..self.nb_vars {
                        mean[v] += responsibilities[(i, j)] * data[(i, v)];
                    }
                }
                mean /= weight;

                let mut cov = DMatrix::zeros(self.nb_vars, self.nb_vars);
                for i in 0..n {
                    let diff = DVector::from_fn(self.nb_vars, |v, _| data[(i, v)] - mean[v]);
                    cov += (&diff * diff.transpose()) * responsibilities[(i, j)];
                }
                cov /= weight;
                for v in 0..self.nb_vars {
                    cov[(v, v)] += COVARIANCE_RIDGE;
                }

                self.priors[j] = weight / n as f64;
                self.means[j] = mean;
                self.covariances[j] = cov;
            }

            let mean_ll = log_likelihood / n as f64;
            if (mean_ll - previous_ll).abs() < EM_CONVERGENCE_TOL {
                return Ok(iteration + 1);
            }
            previous_ll = mean_ll;
        }

        Ok(MAX_EM_ITERATIONS)
    }

    /// Regresión de la mezcla contra el eje temporal (GMR): para cada punto
    /// de la rejilla devuelve la media condicionada de los ejes y la
    /// covarianza condicional, ponderadas por la influencia de cada
    /// componente en ese instante.
    pub fn regression(&self, grid: &DMatrix<f64>) -> Result<Regression, GmmError> {
        if self.nb_vars != 4 {
            return Err(GmmError::Dimension(self.nb_vars));
        }

        let k = self.nb_states();
        let t_count = grid.nrows();
        let mut mean = DMatrix::zeros(4, t_count);
        let mut covariances = Vec::with_capacity(t_count);

        // descomposición por bloques de cada componente:
        // var_t (escalar), cov_yt (3×1), cov_yy (3×3)
        let mut var_t = vec![0.0f64; k];
        let mut cov_yt = vec![Vector3::zeros(); k];
        let mut cov_yy = vec![Matrix3::zeros(); k];
        let mut conditional = vec![Matrix3::zeros(); k];
        for j in 0..k {
            let c = &self.covariances[j];
            var_t[j] = c[(0, 0)].max(f64::MIN_POSITIVE);
            cov_yt[j] = Vector3::new(c[(1, 0)], c[(2, 0)], c[(3, 0)]);
            cov_yy[j] = Matrix3::from_fn(|r, s| c[(r + 1, s + 1)]);
            let outer = cov_yt[j] * cov_yt[j].transpose() / var_t[j];
            let mut cond = cov_yy[j] - outer;
            // simetrización numérica
            cond = (cond + cond.transpose()) * 0.5;
            conditional[j] = cond;
        }

        let mut beta = vec![0.0f64; k];
        for ti in 0..t_count {
            let t = grid[(ti, 0)];

            let mut total = 0.0;
            for j in 0..k {
                let d = t - self.means[j][0];
                let pdf = (-0.5 * d * d / var_t[j]).exp()
                    / (2.0 * std::f64::consts::PI * var_t[j]).sqrt();
                beta[j] = self.priors[j] * pdf;
                total += beta[j];
            }
            if total > 0.0 {
                for b in beta.iter_mut() {
                    *b /= total;
                }
            } else {
                for b in beta.iter_mut() {
                    *b = 1.0 / k as f64;
                }
            }

            let mut y = Vector3::zeros();
            let mut sigma = Matrix3::zeros();
            for j in 0..k {
                let d = t - self.means[j][0];
                let mu_y = Vector3::new(self.means[j][1], self.means[j][2], self.means[j][3]);
                y += beta[j] * (mu_y + cov_yt[j] * (d / var_t[j]));
                sigma += beta[j] * beta[j] * conditional[j];
            }

            mean[(0, ti)] = t;
            for axis in 0..3 {
                mean[(axis + 1, ti)] = y[axis];
            }
            covariances.push((sigma + sigma.transpose()) * 0.5);
        }

        Ok(Regression { mean, covariances })
    }

    /// Parámetros actuales en forma plana (para persistencia e inspección)
    pub fn params(&self) -> MixtureParams {
        MixtureParams {
            nb_states: self.nb_states(),
            nb_vars: self.nb_vars,
            priors: self.priors.clone(),
            means: self.means.iter().map(|m| m.iter().copied().collect()).collect(),
            covariances: self
                .covariances
                .iter()
                .map(|c| {
                    (0..self.nb_vars)
                        .map(|r| (0..self.nb_vars).map(|s| c[(r, s)]).collect())
                        .collect()
                })
                .collect(),
        }
    }

    /// Guarda los parámetros de la mezcla en JSON.
    pub fn save_params(&self, path: &Path) -> Result<(), GmmError> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.params())?;
        Ok(())
    }
}

/// Factor de Cholesky de una covarianza, con reintento regularizado si la
/// matriz no es definida positiva.
struct CholeskyFactor {
    chol: Cholesky<f64, Dyn>,
    log_norm: f64,
}

impl CholeskyFactor {
    fn of(cov: &mut DMatrix<f64>, component: usize) -> Result<Self, GmmError> {
        let dim = cov.nrows();
        let mut attempt = cov.clone();
        let mut ridge = COVARIANCE_RIDGE;
        for _ in 0..8 {
            if let Some(chol) = Cholesky::new(attempt.clone()) {
                let log_det: f64 = chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>() * 2.0;
                let log_norm =
                    -0.5 * (dim as f64 * (2.0 * std::f64::consts::PI).ln() + log_det);
                *cov = attempt;
                return Ok(Self { chol, log_norm });
            }
            ridge *= 10.0;
            for v in 0..dim {
                attempt[(v, v)] += ridge;
            }
        }
        Err(GmmError::Singular(component))
    }

    fn pdf(&self, mean: &DVector<f64>, x: &DVector<f64>) -> f64 {
        let diff = x - mean;
        let solved = self.chol.solve(&diff);
        let quad = diff.dot(&solved);
        (self.log_norm - 0.5 * quad).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Serie sintética de dos regímenes: la primera mitad del tiempo oscila
    /// alrededor de un nivel y la segunda alrededor de otro.
    fn two_regime_data(n: usize, seed: u64) -> DMatrix<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        DMatrix::from_fn(n, 4, |i, v| {
            if v == 0 {
                (i + 1) as f64
            } else {
                let level = if i < n / 2 { 0.0 } else { 5.0 };
                level + rng.gen_range(-0.1..0.1)
            }
        })
    }

    #[test]
    fn test_time_split_occupancy() {
        let data = two_regime_data(100, 7);
        let gmm = GaussianMixture::init_time_split(2, &data).unwrap();

        assert_eq!(gmm.nb_states(), 2);
        assert!((gmm.priors[0] - 0.5).abs() < 1e-12);
        // el primer componente cubre la primera mitad temporal
        assert!(gmm.means[0][0] < 50.0 && gmm.means[1][0] > 50.0);
        assert!(gmm.means[0][1].abs() < 0.5);
        assert!((gmm.means[1][1] - 5.0).abs() < 0.5);
    }

    #[test]
    fn test_init_rejects_too_few_rows() {
        let data = DMatrix::from_row_slice(2, 4, &[1.0; 8]);
        assert!(GaussianMixture::init_time_split(3, &data).is_err());
    }

    #[test]
    fn test_em_converges_on_two_regimes() {
        let data = two_regime_data(200, 11);
        let mut gmm = GaussianMixture::init_time_split(2, &data).unwrap();
        let iterations = gmm.run_em(&data).unwrap();

        assert!(iterations <= MAX_EM_ITERATIONS);
        // los niveles de los dos regímenes se conservan tras el refinamiento
        let mut levels: Vec<f64> = (0..2).map(|j| gmm.means[j][1]).collect();
        levels.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!(levels[0].abs() < 0.5, "level 0: {}", levels[0]);
        assert!((levels[1] - 5.0).abs() < 0.5, "level 1: {}", levels[1]);
    }

    #[test]
    fn test_regression_recovers_linear_trend() {
        // y = 2t en los tres ejes con ruido leve: la media condicionada de
        // un único componente reproduce la recta
        let mut rng = StdRng::seed_from_u64(3);
        let n = 120;
        let data = DMatrix::from_fn(n, 4, |i, v| {
            let t = (i + 1) as f64;
            if v == 0 {
                t
            } else {
                2.0 * t + rng.gen_range(-0.05..0.05)
            }
        });

        let mut gmm = GaussianMixture::init_time_split(1, &data).unwrap();
        gmm.run_em(&data).unwrap();

        let grid = crate::filters::create_interval(1, n as i64);
        let reg = gmm.regression(&grid).unwrap();

        assert_eq!(reg.mean.nrows(), 4);
        assert_eq!(reg.mean.ncols(), n);
        assert_eq!(reg.covariances.len(), n);

        for ti in [0usize, n / 2, n - 1] {
            let t = (ti + 1) as f64;
            assert_eq!(reg.mean[(0, ti)], t);
            for axis in 1..4 {
                assert!(
                    (reg.mean[(axis, ti)] - 2.0 * t).abs() < 0.5,
                    "axis {} at t={}: {}",
                    axis,
                    t,
                    reg.mean[(axis, ti)]
                );
            }
        }

        // covarianza condicional simétrica y pequeña (ruido residual)
        let c = &reg.covariances[n / 2];
        for r in 0..3 {
            for s in 0..3 {
                assert!((c[(r, s)] - c[(s, r)]).abs() < 1e-12);
            }
            assert!(c[(r, r)] < 0.1);
        }
    }

    #[test]
    fn test_regression_requires_four_vars() {
        let data = DMatrix::from_fn(10, 3, |i, v| if v == 0 { i as f64 } else { 1.0 });
        let gmm = GaussianMixture::init_time_split(1, &data).unwrap();
        let grid = crate::filters::create_interval(1, 10);
        assert!(matches!(gmm.regression(&grid), Err(GmmError::Dimension(3))));
    }

    #[test]
    fn test_params_json_round_trip() {
        let data = two_regime_data(60, 5);
        let gmm = GaussianMixture::init_time_split(2, &data).unwrap();

        let json = serde_json::to_string(&gmm.params()).unwrap();
        let back: MixtureParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nb_states, 2);
        assert_eq!(back.nb_vars, 4);
        assert_eq!(back.priors.len(), 2);
        assert_eq!(back.means[0].len(), 4);
        assert_eq!(back.covariances[0].len(), 4);
    }
}
