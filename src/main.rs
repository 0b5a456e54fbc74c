/*
Detector de primitivas de movimiento humano (HMP) en la muñeca

Sistema de reconocimiento que:
1. Entrena modelos GMM+GMR a partir de pruebas etiquetadas (--model)
2. Clasifica flujos de aceleración contra los modelos cargados
3. Extrae intervalos de activación por movimiento (--bracelet, --reason)

Ejemplos:
./brazalete -h
./brazalete -m Sweden
./brazalete -v climb Sweden 6
./brazalete -t drink_drink_stand_sit_drink.txt
./brazalete -c /dev/ttyUSB0
./brazalete -r ./Results/longTest/ res_drink_drink_stand_sit_drink.txt
./brazalete -B /dev/ttyUSB0
*/

use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, RecvTimeoutError};

use brazalete::classifier::{Classifier, DatasetLayout};
use brazalete::creator::Creator;
use brazalete::device::Device;
use brazalete::intervals::{IntervalEvent, IntervalTracker};
use brazalete::publisher::Publisher;

const DEFAULT_DATASET: &str = "Sweden";
const DEFAULT_LOG: &str = "log.txt";

fn print_help() {
    println!();
    println!("\t\t -------- DETECTOR DE HMP --------");
    println!("Opciones disponibles:");
    println!("01) -h --help                      : esta ayuda.");
    println!("02) -m --model [dataset]           : crear los modelos de [dataset].");
    println!("03) -v --validate [modelo] [set] [n]: validar [modelo] con [n] pruebas de [set].");
    println!("04) -t --test [prueba]             : clasificación off-line de [prueba].");
    println!("05) -c --classify [fuente]         : clasificación en línea del flujo de [fuente].");
    println!("06) -r --reason [ruta] [archivo]   : razonamiento off-line sobre [ruta]/[archivo].");
    println!("07) -B --bracelet [fuente]         : análisis HMP en línea del flujo de [fuente].");
    println!();
    println!("Ejemplos:");
    println!("01) ./brazalete -h");
    println!("02) ./brazalete -m Sweden");
    println!("03) ./brazalete -v climb Sweden 6");
    println!("04) ./brazalete -t drink_drink_stand_sit_drink.txt");
    println!("05) ./brazalete -c /dev/ttyUSB0");
    println!("06) ./brazalete -r ./Results/longTest/ res_drink_drink_stand_sit_drink.txt");
    println!("07) ./brazalete -B /dev/ttyUSB0");
    println!();
}

/// Publica un evento de intervalo en la clave `Bracelet.HMP.<modelo>`.
fn publish_bracelet_event(publisher: &Publisher, event: &IntervalEvent) -> Result<()> {
    match event {
        IntervalEvent::Opened { name, possibility } => {
            println!("👀 Veo: {}", name);
            publisher.publish_global(&format!("Bracelet.HMP.{}", name), &possibility.to_string())?;
        }
        IntervalEvent::Updated { name, possibility } => {
            publisher.publish_global(&format!("Bracelet.HMP.{}", name), &possibility.to_string())?;
        }
        IntervalEvent::Closed { name } => {
            publisher.publish_global(&format!("Bracelet.HMP.{}", name), "0")?;
        }
        IntervalEvent::Published { name, record } => {
            publisher.publish_global(&format!("Bracelet.HMP.{}", name), &record.to_string())?;
        }
        IntervalEvent::Discarded { name, reason } => {
            println!("🚫 {}: falso positivo ({})", name, reason);
        }
    }
    Ok(())
}

/// Lazo de clasificación en línea: un hilo lector alimenta las líneas por
/// un canal acotado y el lazo principal las consume. Un timeout de lectura
/// produce un hueco en el flujo; la desconexión (EOF) lo termina.
fn run_stream(
    source: &str,
    dataset: &str,
    device: Device,
    publisher: Publisher,
    with_bracelet: bool,
) -> Result<()> {
    let mut classifier = Classifier::new(DatasetLayout::default(), dataset, device, publisher.clone())?;
    classifier.print_set_info();

    let mut tracker = with_bracelet.then(|| IntervalTracker::new(classifier.model_names()));
    let mut past = vec![0.0f64; classifier.nb_models()];

    let (tx, rx) = bounded::<String>(256);
    let source_owned = source.to_string();
    let reader = thread::spawn(move || {
        let file = match File::open(&source_owned) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("❌ No se pudo abrir la fuente {}: {}", source_owned, e);
                return;
            }
        };
        for line in BufReader::new(file).lines() {
            match line {
                Ok(l) => {
                    if tx.send(l).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("❌ Error de lectura en la fuente: {}", e);
                    break;
                }
            }
        }
    });

    println!("🎬 Clasificando el flujo de {}...", source);
    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(line) => {
                let sample = match device.extract_actual(&line) {
                    Ok(s) => s,
                    Err(e) => {
                        // la muestra se descarta; los contadores no avanzan
                        eprintln!("⚠️  Muestra descartada: {}", e);
                        continue;
                    }
                };

                if let Some(possibilities) = classifier.process_sample(sample)? {
                    classifier.publish_dynamic(&possibilities)?;

                    if let Some(tracker) = tracker.as_mut() {
                        let n_samples = classifier.samples_seen();
                        for (i, &p) in possibilities.iter().enumerate() {
                            for event in tracker.simple_step(i, n_samples, p, past[i]) {
                                publish_bracelet_event(&publisher, &event)?;
                            }
                        }
                    }
                    past.copy_from_slice(&possibilities);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                eprintln!("⚠️  Timeout de lectura");
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let _ = reader.join();
    Ok(())
}

fn main() -> Result<()> {
    let device = Device::Mpu6050;
    let publisher = Publisher::log_file(DEFAULT_LOG);
    let layout = DatasetLayout::default();

    println!("🦾 Detector de HMP");
    println!("🔌 Dispositivo por defecto: {}", device.name());
    println!("📂 Conjunto de datos por defecto: {}", DEFAULT_DATASET);
    println!("📝 Publicador por defecto: {}", publisher.name());

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        print_help();
        return Ok(());
    }

    match args[0].as_str() {
        "-h" | "--help" => print_help(),

        "-m" | "--model" => {
            let dataset = args.get(1).map(String::as_str).unwrap_or(DEFAULT_DATASET);
            println!("📂 Carpeta de modelado: {}", dataset);
            let creator = Creator::new(&layout.models_root, dataset, device);
            creator.generate_all_models()?;
            println!("✅ Modelos creados en: {}", creator.dataset_folder().display());
        }

        "-v" | "--validate" => {
            let (model, dataset, trials) = match (args.get(1), args.get(2), args.get(3)) {
                (Some(m), Some(d), Some(n)) => (m, d, n),
                _ => bail!("Uso: brazalete -v <modelo> <dataset> <n>"),
            };
            let trials: usize = trials
                .parse()
                .with_context(|| format!("número de pruebas inválido: {}", trials))?;
            let mut classifier = Classifier::new(layout.clone(), dataset, device, publisher)?;
            classifier.validate_model(model, dataset, trials)?;
            println!("✅ Resultados en: {}", layout.results_root.join(dataset).display());
        }

        "-t" | "--test" => {
            let trial = args.get(1).map(String::as_str);
            let trial = match trial {
                Some(t) => t,
                None => bail!("Uso: brazalete -t <prueba>"),
            };
            let mut classifier =
                Classifier::new(layout.clone(), DEFAULT_DATASET, device, publisher)?;
            classifier.long_test(trial)?;
            println!(
                "✅ Resultados en: {}",
                layout.results_root.join("longTest").display()
            );
        }

        "-c" | "--classify" => {
            let source = match args.get(1) {
                Some(s) => s,
                None => bail!("Uso: brazalete -c <fuente>"),
            };
            run_stream(source, DEFAULT_DATASET, device, publisher, false)?;
        }

        "-r" | "--reason" => {
            let (dir, poss_file) = match (args.get(1), args.get(2)) {
                (Some(d), Some(f)) => (d, f),
                _ => bail!("Uso: brazalete -r <ruta> <archivo>"),
            };
            let mut tracker =
                IntervalTracker::from_config(&layout.models_root.join(DEFAULT_DATASET))?;
            let result = tracker.offline_reason(Path::new(dir), poss_file)?;
            println!("✅ Resultados en: {}", result.display());
        }

        "-B" | "--bracelet" => {
            let source = match args.get(1) {
                Some(s) => s,
                None => bail!("Uso: brazalete -B <fuente>"),
            };
            run_stream(source, DEFAULT_DATASET, device, publisher, true)?;
        }

        other => {
            print_help();
            bail!("opción no reconocida: {}", other);
        }
    }

    Ok(())
}
