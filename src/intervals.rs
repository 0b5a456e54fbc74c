use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::classifier::parse_classifier_config;
use crate::types::SIMPLE_THRESHOLD;

/// Registro de un intervalo cerrado, tal como se publica:
/// `[s_lo;s_hi]-[e_lo;e_hi]: posibilidad`
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalRecord {
    pub start: (u64, u64),
    pub end: (u64, u64),
    pub possibility: f64,
}

impl fmt::Display for IntervalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{};{}]-[{};{}]: {}",
            self.start.0, self.start.1, self.end.0, self.end.1, self.possibility
        )
    }
}

/// Motivo de descarte de un intervalo en la política de campana
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// la posibilidad volvió a subir durante el descenso
    NoBellShape,
    /// la curva bajó del nivel de referencia antes de cerrar
    NoSymmetry,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NoBellShape => write!(f, "sin forma de campana"),
            RejectReason::NoSymmetry => write!(f, "sin simetría"),
        }
    }
}

/// Eventos que el rastreador emite hacia el publicador. El rastreador no
/// hace E/S: quien consume los eventos decide cómo publicarlos.
#[derive(Debug, Clone, PartialEq)]
pub enum IntervalEvent {
    /// se abrió un intervalo (política simple: publicar la posibilidad)
    Opened { name: String, possibility: f64 },
    /// intervalo abierto actualizado (política simple: publicar la posibilidad)
    Updated { name: String, possibility: f64 },
    /// cierre de la política simple (publicar "0" en la clave del intervalo)
    Closed { name: String },
    /// cierre con registro completo (política de campana)
    Published { name: String, record: IntervalRecord },
    /// intervalo descartado por violar la forma esperada
    Discarded { name: String, reason: RejectReason },
}

/// Estado del intervalo de activación de un modelo
#[derive(Debug, Clone)]
pub struct Interval {
    pub name: String,
    pub open: bool,
    pub start: (u64, u64),
    /// extremo provisional del intervalo mientras sigue abierto
    pub end_low: u64,
    /// pico de posibilidad visto dentro del intervalo
    pub possibility: f64,
    /// posibilidad en la muestra previa a la apertura (línea de base)
    pub ref_possibility: f64,
    /// contador con signo: crece al subir, decrece al bajar
    pub rising_time: i64,
    /// si la curva ya empezó a descender dentro de este intervalo
    descending: bool,
}

impl Interval {
    fn new(name: String) -> Self {
        Self {
            name,
            open: false,
            start: (0, 0),
            end_low: 0,
            possibility: 0.0,
            ref_possibility: 0.0,
            rising_time: 0,
            descending: false,
        }
    }

    fn start_interval(&mut self, possibility: f64, n_samples: u64, past_possibility: f64) {
        self.open = true;
        self.start = (n_samples, n_samples);
        self.end_low = 0;
        self.possibility = possibility;
        self.ref_possibility = past_possibility;
        self.rising_time = 1;
        self.descending = false;
    }

    fn record(&self) -> IntervalRecord {
        IntervalRecord {
            start: self.start,
            end: (self.end_low, self.end_low),
            possibility: self.possibility,
        }
    }
}

/// Rastreador de intervalos de activación, uno por modelo cargado.
pub struct IntervalTracker {
    intervals: Vec<Interval>,
}

impl IntervalTracker {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            intervals: names.into_iter().map(Interval::new).collect(),
        }
    }

    /// Construye el rastreador con los nombres de `Classifierconfig.txt`
    /// (los pesos y umbrales del archivo no se usan aquí).
    pub fn from_config(dataset_folder: &Path) -> Result<Self> {
        let specs = parse_classifier_config(&dataset_folder.join("Classifierconfig.txt"))
            .context("no se pudo leer la configuración del clasificador")?;
        Ok(Self::new(specs.into_iter().map(|s| s.name).collect()))
    }

    pub fn nb_models(&self) -> usize {
        self.intervals.len()
    }

    pub fn interval(&self, i: usize) -> &Interval {
        &self.intervals[i]
    }

    /// Política simple (en línea): el intervalo vive mientras la
    /// posibilidad supere el umbral fijo.
    pub fn simple_step(
        &mut self,
        i: usize,
        n_samples: u64,
        possibility: f64,
        past_possibility: f64,
    ) -> Vec<IntervalEvent> {
        let iv = &mut self.intervals[i];
        let mut events = Vec::new();

        if possibility > SIMPLE_THRESHOLD {
            if !iv.open {
                iv.start_interval(possibility, n_samples, past_possibility);
                events.push(IntervalEvent::Opened {
                    name: iv.name.clone(),
                    possibility,
                });
            } else {
                iv.end_low = n_samples;
                if possibility >= iv.possibility {
                    iv.possibility = possibility;
                }
                events.push(IntervalEvent::Updated {
                    name: iv.name.clone(),
                    possibility,
                });
            }
        } else if iv.open {
            iv.open = false;
            events.push(IntervalEvent::Closed {
                name: iv.name.clone(),
            });
        }

        events
    }

    /// Política de campana (a-posteriori): sólo sobreviven los intervalos
    /// cuya curva de posibilidad sube de forma monótona hasta el pico y
    /// desciende de forma monótona y simétrica.
    pub fn accurate_step(
        &mut self,
        i: usize,
        n_samples: u64,
        possibility: f64,
        past_possibility: f64,
    ) -> Vec<IntervalEvent> {
        let iv = &mut self.intervals[i];
        let mut events = Vec::new();

        if possibility > 0.0 {
            if !iv.open {
                iv.start_interval(possibility, n_samples, past_possibility);
                events.push(IntervalEvent::Opened {
                    name: iv.name.clone(),
                    possibility,
                });
            } else if iv.descending && possibility > past_possibility {
                // la curva vuelve a subir después de haber descendido
                iv.open = false;
                events.push(IntervalEvent::Discarded {
                    name: iv.name.clone(),
                    reason: RejectReason::NoBellShape,
                });
            } else if !iv.descending && possibility >= iv.possibility {
                iv.end_low = n_samples;
                iv.possibility = possibility;
                iv.rising_time += 1;
            } else {
                iv.descending = true;
                iv.rising_time -= 1;
                iv.end_low = n_samples;
                if iv.rising_time == 0 && possibility < iv.ref_possibility {
                    iv.open = false;
                    events.push(IntervalEvent::Discarded {
                        name: iv.name.clone(),
                        reason: RejectReason::NoSymmetry,
                    });
                } else if iv.rising_time >= 0 && possibility == iv.ref_possibility {
                    iv.open = false;
                    events.push(IntervalEvent::Published {
                        name: iv.name.clone(),
                        record: iv.record(),
                    });
                }
            }
        } else if iv.open && iv.ref_possibility == 0.0 {
            // la posibilidad volvió a cero: cierre por retorno a la base
            iv.open = false;
            events.push(IntervalEvent::Published {
                name: iv.name.clone(),
                record: iv.record(),
            });
        }

        events
    }

    /// Cierre de fin de flujo: los intervalos aún abiertos con línea de
    /// base cero se cierran y se publican.
    pub fn finish(&mut self) -> Vec<IntervalEvent> {
        let mut events = Vec::new();
        for iv in &mut self.intervals {
            if iv.open && iv.ref_possibility == 0.0 {
                iv.open = false;
                events.push(IntervalEvent::Published {
                    name: iv.name.clone(),
                    record: iv.record(),
                });
            }
        }
        events
    }

    /// Análisis a-posteriori de un archivo de posibilidades grabado:
    /// aplica la política de campana línea por línea y escribe los
    /// registros cerrados en `<dir>/Rres_<archivo>`.
    pub fn offline_reason(&mut self, dir: &Path, poss_file: &str) -> Result<PathBuf> {
        let input_path = dir.join(poss_file);
        let result_path = dir.join(format!("Rres_{}", poss_file));

        let input = File::open(&input_path)
            .with_context(|| format!("no se pudo abrir {:?}", input_path))?;
        if let Some(parent) = result_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output = BufWriter::new(
            File::create(&result_path)
                .with_context(|| format!("no se pudo crear {:?}", result_path))?,
        );

        println!("[HMP] Leyendo posibilidades de: {}", input_path.display());

        let nb_models = self.nb_models();
        let mut past = vec![0.0f64; nb_models];
        let mut n_samples: u64 = 0;

        for (line_idx, line) in BufReader::new(input).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let values: Vec<f64> = line
                .split_whitespace()
                .map(|t| t.parse::<f64>())
                .collect::<Result<_, _>>()
                .with_context(|| format!("valor ilegible en la línea {}", line_idx + 1))?;
            if values.len() != nb_models {
                bail!(
                    "línea {}: se esperaban {} posibilidades, hay {}",
                    line_idx + 1,
                    nb_models,
                    values.len()
                );
            }

            for i in 0..nb_models {
                for event in self.accurate_step(i, n_samples, values[i], past[i]) {
                    report_event(&mut output, &event)?;
                }
            }

            past.copy_from_slice(&values);
            n_samples += 1;
        }

        for event in self.finish() {
            report_event(&mut output, &event)?;
        }

        Ok(result_path)
    }
}

/// Vuelca un evento al archivo de resultados; las aperturas y los descartes
/// se informan por consola, como hace el modo en línea.
fn report_event(output: &mut impl Write, event: &IntervalEvent) -> Result<()> {
    match event {
        IntervalEvent::Opened { name, .. } => {
            println!("[HMP] {}: intervalo abierto", name);
        }
        IntervalEvent::Discarded { name, reason } => {
            println!("[HMP] {}: falso positivo ({})", name, reason);
        }
        IntervalEvent::Published { name, record } => {
            writeln!(output, "HMP.{} {}", name, record)?;
        }
        IntervalEvent::Updated { .. } | IntervalEvent::Closed { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> IntervalTracker {
        IntervalTracker::new(vec!["drink".to_string()])
    }

    fn feed_simple(tracker: &mut IntervalTracker, stream: &[f64]) -> Vec<IntervalEvent> {
        let mut events = Vec::new();
        let mut past = 0.0;
        for (n, &p) in stream.iter().enumerate() {
            events.extend(tracker.simple_step(0, n as u64, p, past));
            past = p;
        }
        events
    }

    fn feed_accurate(tracker: &mut IntervalTracker, stream: &[f64]) -> Vec<IntervalEvent> {
        let mut events = Vec::new();
        let mut past = 0.0;
        for (n, &p) in stream.iter().enumerate() {
            events.extend(tracker.accurate_step(0, n as u64, p, past));
            past = p;
        }
        events
    }

    #[test]
    fn test_simple_open_update_close() {
        let mut t = tracker();
        let events = feed_simple(&mut t, &[0.5, 0.85, 0.9, 0.7, 0.6]);

        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            IntervalEvent::Opened { possibility, .. } if *possibility == 0.85
        ));
        assert!(matches!(
            &events[1],
            IntervalEvent::Updated { possibility, .. } if *possibility == 0.9
        ));
        assert!(matches!(&events[2], IntervalEvent::Closed { .. }));

        let iv = t.interval(0);
        assert!(!iv.open);
        assert_eq!(iv.start, (1, 1));
        assert_eq!(iv.end_low, 2);
        assert_eq!(iv.possibility, 0.9);
    }

    #[test]
    fn test_simple_open_iff_above_threshold_run() {
        let mut t = tracker();
        let stream = [0.9, 0.81, 0.7, 0.95, 0.85, 0.2, 0.9];
        let mut past = 0.0;
        for (n, &p) in stream.iter().enumerate() {
            t.simple_step(0, n as u64, p, past);
            past = p;
            // invariante: abierto si y sólo si hay un tramo > 0.8 sin cortes
            let expected_open = p > SIMPLE_THRESHOLD;
            assert_eq!(t.interval(0).open, expected_open, "sample {}", n);
        }
    }

    #[test]
    fn test_simple_close_publishes_zero_only_once() {
        let mut t = tracker();
        let events = feed_simple(&mut t, &[0.9, 0.5, 0.5, 0.5]);
        let closes = events
            .iter()
            .filter(|e| matches!(e, IntervalEvent::Closed { .. }))
            .count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_accurate_rejects_non_bell() {
        let mut t = tracker();
        let events = feed_accurate(&mut t, &[0.0, 0.3, 0.2, 0.4, 0.0]);

        assert!(matches!(&events[0], IntervalEvent::Opened { .. }));
        assert!(matches!(
            &events[1],
            IntervalEvent::Discarded {
                reason: RejectReason::NoBellShape,
                ..
            }
        ));
        // descartado en silencio: ninguna publicación
        assert!(!events
            .iter()
            .any(|e| matches!(e, IntervalEvent::Published { .. })));
    }

    #[test]
    fn test_accurate_symmetric_publish() {
        let mut t = tracker();
        let events = feed_accurate(&mut t, &[0.0, 0.4, 0.6, 0.4, 0.0]);

        let published: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                IntervalEvent::Published { record, .. } => Some(record.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].start, (1, 1));
        assert_eq!(published[0].end, (3, 3));
        assert_eq!(published[0].possibility, 0.6);
    }

    #[test]
    fn test_accurate_symmetric_close_on_reference_level() {
        // la base no es cero: el cierre llega cuando la posibilidad vuelve
        // exactamente al nivel de referencia con el contador en cero
        let mut t = tracker();
        let events = feed_accurate(&mut t, &[0.2, 0.5, 0.2]);
        // apertura en la muestra 0 con referencia 0 (no había muestra previa)
        assert!(matches!(&events[0], IntervalEvent::Opened { .. }));

        let mut t = IntervalTracker::new(vec!["sit".into()]);
        let mut events = Vec::new();
        let mut past = 0.2;
        for (n, &p) in [0.5, 0.7, 0.5, 0.2].iter().enumerate() {
            events.extend(t.accurate_step(0, n as u64, p, past));
            past = p;
        }
        let published: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                IntervalEvent::Published { record, .. } => Some(record.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].end, (3, 3));
        assert_eq!(published[0].possibility, 0.7);
    }

    #[test]
    fn test_accurate_rejects_asymmetric_descent() {
        // sube una vez y baja por debajo de la referencia con el contador
        // en cero: descarte por asimetría
        let mut t = tracker();
        let mut events = Vec::new();
        let mut past = 0.3;
        for (n, &p) in [0.5, 0.1].iter().enumerate() {
            events.extend(t.accurate_step(0, n as u64, p, past));
            past = p;
        }
        assert!(matches!(
            &events[1],
            IntervalEvent::Discarded {
                reason: RejectReason::NoSymmetry,
                ..
            }
        ));
    }

    #[test]
    fn test_accurate_closes_open_interval_at_end_of_stream() {
        let mut t = tracker();
        let events = feed_accurate(&mut t, &[0.0, 0.4, 0.6]);
        assert!(!events
            .iter()
            .any(|e| matches!(e, IntervalEvent::Published { .. })));

        let final_events = t.finish();
        assert_eq!(final_events.len(), 1);
        assert!(matches!(
            &final_events[0],
            IntervalEvent::Published { record, .. } if record.possibility == 0.6
        ));
        assert!(!t.interval(0).open);
    }

    #[test]
    fn test_rising_time_can_go_negative_while_open() {
        // descenso largo y monótono: el contador queda negativo sin que el
        // intervalo se cierre hasta volver a la base
        let mut t = tracker();
        feed_accurate(&mut t, &[0.0, 0.8, 0.6, 0.5, 0.4]);
        let iv = t.interval(0);
        assert!(iv.open);
        assert!(iv.rising_time < 0);
    }

    #[test]
    fn test_record_format() {
        let record = IntervalRecord {
            start: (12, 12),
            end: (40, 40),
            possibility: 0.93,
        };
        assert_eq!(record.to_string(), "[12;12]-[40;40]: 0.93");
    }

    #[test]
    fn test_offline_reason_writes_records() {
        let dir = std::env::temp_dir().join("brazalete_reason");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("poss.txt"),
            "0 0\n0.4 0\n0.6 0\n0.4 0\n0 0\n",
        )
        .unwrap();

        let mut t = IntervalTracker::new(vec!["drink".into(), "sit".into()]);
        let result = t.offline_reason(&dir, "poss.txt").unwrap();

        let content = std::fs::read_to_string(result).unwrap();
        assert_eq!(content, "HMP.drink [1;1]-[3;3]: 0.6\n");
    }
}
