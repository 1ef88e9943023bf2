pub mod families; // count distribution families and their CDF/quantile maps
pub mod glm; // per-gene IRLS fitting with dispersion and zero-inflation
