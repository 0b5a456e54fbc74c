use thiserror::Error;

use crate::types::Sample;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("truncated line: expected 8 fields, got {0}")]
    Truncated(usize),

    #[error("invalid integer field `{field}`: {source}")]
    BadField {
        field: &'static str,
        source: std::num::ParseIntError,
    },
}

/// Drivers de los dispositivos inerciales soportados.
///
/// Cada variante sabe decodificar una línea cruda del dispositivo y
/// convertir la terna de aceleraciones codificadas a m/s².
#[derive(Debug, Clone, Copy)]
pub enum Device {
    /// SparkFun MPU6050: rango de ±2g mapeado sobre 16 bits
    Mpu6050,
}

/// Rango codificado del MPU6050 (16 bits)
const MPU6050_CODED_RANGE: f64 = 65535.0;
/// Excursión total del rango de sensado [-2g; +2g] en m/s²
const MPU6050_SENSING_RANGE: f64 = 39.2266;

impl Device {
    pub fn name(&self) -> &'static str {
        match self {
            Device::Mpu6050 => "SparkFun MPU6050",
        }
    }

    /// Extrae la terna de aceleraciones reales de una línea del dispositivo.
    ///
    /// Formato de línea (enteros separados por espacios):
    /// `dev ax ay az gx gy gz motion_flag`
    /// El giróscopo y las banderas se leen y se descartan.
    pub fn extract_actual(&self, line: &str) -> Result<Sample, DeviceError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(DeviceError::Truncated(fields.len()));
        }

        let parse = |idx: usize, field: &'static str| -> Result<i64, DeviceError> {
            fields[idx]
                .parse::<i64>()
                .map_err(|source| DeviceError::BadField { field, source })
        };

        // campo 0 es la bandera de dispositivo; 4..6 giróscopo; 7 movimiento
        parse(0, "dev")?;
        let ax = parse(1, "ax")? as f64;
        let ay = parse(2, "ay")? as f64;
        let az = parse(3, "az")? as f64;
        parse(4, "gx")?;
        parse(5, "gy")?;
        parse(6, "gz")?;
        parse(7, "motion_flag")?;

        match self {
            Device::Mpu6050 => Ok([
                ax / MPU6050_CODED_RANGE * MPU6050_SENSING_RANGE,
                ay / MPU6050_CODED_RANGE * MPU6050_SENSING_RANGE,
                az / MPU6050_CODED_RANGE * MPU6050_SENSING_RANGE,
            ]),
        }
    }
}
