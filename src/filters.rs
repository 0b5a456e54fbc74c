use nalgebra::{Complex, DMatrix};
use thiserror::Error;

use crate::types::{CHEBYSHEV_ORDER, CUTOFF_FREQ, PASSBAND_RIPPLE_DB, SAMPLING_FREQ};

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("median window size must be positive, got {0}")]
    WindowSize(usize),
}

/// Crea un vector columna [start, start+1, ..., stop].
///
/// Se usa para anteponer la columna de tiempo a los datos de entrenamiento
/// y como rejilla de entrada de la regresión.
pub fn create_interval(start: i64, stop: i64) -> DMatrix<f64> {
    if stop < start {
        return DMatrix::zeros(0, 1);
    }
    let n = (stop - start + 1) as usize;
    DMatrix::from_fn(n, 1, |i, _| (start + i as i64) as f64)
}

/// Filtro de mediana por filas, con ventana simétrica de tamaño `size`.
///
/// En los bordes la ventana se trunca: las posiciones sin vecino válido
/// aportan 0 (la ventana se inicializa a ceros) y la salida es el elemento
/// en la posición size/2 de la ventana ordenada.
pub fn median_filter(matrix: &mut DMatrix<f64>, size: usize) -> Result<(), FilterError> {
    if size == 0 {
        return Err(FilterError::WindowSize(size));
    }

    let step = size / 2;
    let ncols = matrix.ncols();
    let mut window = vec![0.0f64; size];

    for r in 0..matrix.nrows() {
        let row: Vec<f64> = (0..ncols).map(|c| matrix[(r, c)]).collect();
        for i in 0..ncols {
            for (j, slot) in window.iter_mut().enumerate() {
                let src = i as i64 + j as i64 - step as i64;
                *slot = if src >= 0 && (src as usize) < ncols {
                    row[src as usize]
                } else {
                    0.0
                };
            }
            window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            matrix[(r, i)] = window[size / 2];
        }
    }

    Ok(())
}

/// Sección bicuadrática de un filtro IIR en cascada
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    /// Procesa una señal en el lugar con estado inicial nulo
    /// (forma directa II transpuesta).
    fn process(&self, signal: &mut [f64]) {
        let mut s1 = 0.0;
        let mut s2 = 0.0;
        for x in signal.iter_mut() {
            let y = self.b0 * *x + s1;
            s1 = self.b1 * *x - self.a1 * y + s2;
            s2 = self.b2 * *x - self.a2 * y;
            *x = y;
        }
    }
}

/// Diseña las secciones bicuadráticas de un pasa-bajos Chebyshev I.
///
/// `cutoff` es el borde de la banda de paso (convención de rizado).
/// Prototipo analógico normalizado + transformación bilineal con prewarp.
fn chebyshev1_lowpass_sections(
    order: usize,
    sampling_freq: f64,
    cutoff: f64,
    ripple_db: f64,
) -> Vec<Biquad> {
    let n = order;
    let epsilon = (10f64.powf(ripple_db / 10.0) - 1.0).sqrt();
    let a = (1.0 / epsilon).asinh() / n as f64;
    let sinh_a = a.sinh();
    let cosh_a = a.cosh();

    // prewarp del borde de banda
    let omega = (std::f64::consts::PI * cutoff / sampling_freq).tan();

    let analog_pole = |k: usize| -> Complex<f64> {
        let theta = std::f64::consts::PI * (2.0 * k as f64 - 1.0) / (2.0 * n as f64);
        Complex::new(-sinh_a * theta.sin(), cosh_a * theta.cos())
    };

    let bilinear = |p: Complex<f64>| -> Complex<f64> {
        (Complex::new(1.0, 0.0) + p) / (Complex::new(1.0, 0.0) - p)
    };

    let mut sections = Vec::with_capacity(n.div_ceil(2));

    // pares conjugados
    for k in 1..=(n / 2) {
        let zp = bilinear(analog_pole(k) * omega);
        let a1 = -2.0 * zp.re;
        let a2 = zp.norm_sqr();
        // ceros dobles en z = -1, ganancia unitaria en continua por sección
        let g = (1.0 + a1 + a2) / 4.0;
        sections.push(Biquad {
            b0: g,
            b1: 2.0 * g,
            b2: g,
            a1,
            a2,
        });
    }

    // polo real central para órdenes impares (sección de primer orden)
    if n % 2 == 1 {
        let zp = bilinear(Complex::new(-sinh_a, 0.0) * omega);
        let a1 = -zp.re;
        let g = (1.0 + a1) / 2.0;
        sections.push(Biquad {
            b0: g,
            b1: g,
            b2: 0.0,
            a1,
            a2: 0.0,
        });
    }

    // en orden par la ganancia en continua queda en el valle del rizado
    if n % 2 == 0 {
        if let Some(first) = sections.first_mut() {
            let dc_gain = 10f64.powf(-ripple_db / 20.0);
            first.b0 *= dc_gain;
            first.b1 *= dc_gain;
            first.b2 *= dc_gain;
        }
    }

    sections
}

/// Aplica el pasa-bajos Chebyshev I en el lugar, fila por fila.
///
/// La matriz se organiza con filas = canales (ejes) y columnas = tiempo.
/// Cada invocación parte de estado nulo: la salida sólo depende de la
/// ventana recibida.
pub fn chebyshev_lowpass(matrix: &mut DMatrix<f64>) {
    let sections = chebyshev1_lowpass_sections(
        CHEBYSHEV_ORDER,
        SAMPLING_FREQ,
        CUTOFF_FREQ,
        PASSBAND_RIPPLE_DB,
    );

    let ncols = matrix.ncols();
    let mut channel = vec![0.0f64; ncols];
    for r in 0..matrix.nrows() {
        for c in 0..ncols {
            channel[c] = matrix[(r, c)];
        }
        for section in &sections {
            section.process(&mut channel);
        }
        for c in 0..ncols {
            matrix[(r, c)] = channel[c];
        }
    }
}
