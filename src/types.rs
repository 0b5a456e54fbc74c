/// Muestra tri-axial de aceleración en m/s²: [ax, ay, az]
pub type Sample = [f64; 3];

/// Número de ejes del acelerómetro
pub const NUM_AXES: usize = 3;

/// Tamaño de la ventana del filtro de mediana
pub const MEDIAN_WINDOW: usize = 3;

/// Parámetros del filtro pasa-bajos Chebyshev I
pub const CHEBYSHEV_ORDER: usize = 2;
pub const SAMPLING_FREQ: f64 = 32.0; // Hz
pub const CUTOFF_FREQ: f64 = 0.25; // Hz
pub const PASSBAND_RIPPLE_DB: f64 = 0.001;

/// Umbral de posibilidad de la política simple de intervalos
pub const SIMPLE_THRESHOLD: f64 = 0.8;

/// Iteraciones máximas del algoritmo EM (al llegar al tope se acepta el
/// mejor ajuste obtenido hasta el momento)
pub const MAX_EM_ITERATIONS: usize = 100;

/// Variación mínima de log-verosimilitud para declarar convergencia del EM
pub const EM_CONVERGENCE_TOL: f64 = 1e-4;
