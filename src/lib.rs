/*!
Reconocimiento de primitivas de movimiento humano (HMP) en la muñeca.

El sistema compara un flujo de aceleraciones tri-axiales contra una
biblioteca de modelos pre-entrenados (uno por movimiento: beber, sentarse,
subir escaleras...) y produce, por cada muestra tras el calentamiento, un
vector de "posibilidades" en [0, 1]. De ese flujo de posibilidades se
derivan los intervalos de activación de cada movimiento.

Módulos principales:
- `creator`: entrenamiento de modelos con GMM+GMR sobre pruebas etiquetadas
- `classifier`: ventana deslizante, filtrado y distancia de Mahalanobis
- `intervals`: máquina de estados que convierte posibilidades en intervalos
- `filters`: mediana, pasa-bajos Chebyshev I y utilidades de matrices
- `device` / `publisher`: fronteras con el sensor y con el mundo exterior
*/

pub mod classifier;
pub mod creator;
pub mod device;
pub mod filters;
pub mod gmm;
pub mod intervals;
pub mod model;
pub mod publisher;
pub mod types;
