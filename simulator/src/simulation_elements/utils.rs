use rand::Rng;
use rand_distr::{Distribution, Exp, Normal};
use serde::Deserialize;
use std::{
    env::{self, VarError},
    num::{ParseFloatError, ParseIntError},
    str::FromStr,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum JsonValueError {
    #[error("Cannot Extract Environment Variable")]
    EnvVar(#[from] VarError),
    #[error("Invalid String to Float: {0}")]
    FloatFromStr(#[from] ParseFloatError),
    #[error("Invalid String to Int: {0}")]
    IntFromStr(#[from] ParseIntError),
    #[error("Invalid Uniform Distribution: {0} exceeds {1}")]
    UniformDistribution(f64, f64),
    #[error("Invalid Normal Distribution: {0}")]
    NormalDistribution(#[from] rand_distr::NormalError),
    #[error("Invalid Exponential Distribution: {0}")]
    ExpDistribution(#[from] rand_distr::ExpError),
}

/// A value fixed for the whole simulation.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum NumConstant<T> {
    Const(T),
    FromEnvVar(String),
}

impl<T> NumConstant<T>
where
    T: FromStr + Copy,
    JsonValueError: From<<T as FromStr>::Err>,
{
    pub(crate) fn value(&self) -> Result<T, JsonValueError> {
        match self {
            Self::Const(v) => Ok(*v),
            Self::FromEnvVar(environment_variable) => Ok(env::var(environment_variable)?.parse()?),
        }
    }
}

/// A value which may depend on the index of the simulated event.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum NumExpression {
    Const(f64),
    FromEnvVar(String),
    NumFunc(Transformation),
}

impl NumExpression {
    pub(crate) fn value(&self, event_index: usize) -> Result<f64, JsonValueError> {
        match self {
            Self::Const(v) => Ok(*v),
            Self::FromEnvVar(environment_variable) => Ok(env::var(environment_variable)?.parse()?),
            Self::NumFunc(event_function) => Ok(event_function.transform(event_index as f64)),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case", tag = "random-type")]
pub(crate) enum FloatRandomDistribution {
    ConstantFloat {
        value: NumExpression,
    },
    UniformFloat {
        min: NumExpression,
        max: NumExpression,
    },
    Normal {
        mean: NumExpression,
        sd: NumExpression,
    },
    Exponential {
        lifetime: NumExpression,
    },
}

impl FloatRandomDistribution {
    pub(crate) fn sample(
        &self,
        rng: &mut impl Rng,
        event_index: usize,
    ) -> Result<f64, JsonValueError> {
        match self {
            Self::ConstantFloat { value } => value.value(event_index),
            Self::UniformFloat { min, max } => {
                let (min, max) = (min.value(event_index)?, max.value(event_index)?);
                if min > max {
                    return Err(JsonValueError::UniformDistribution(min, max));
                }
                if min == max {
                    return Ok(min);
                }
                Ok(rng.random_range(min..max))
            }
            Self::Normal { mean, sd } => {
                Ok(Normal::new(mean.value(event_index)?, sd.value(event_index)?)?.sample(rng))
            }
            Self::Exponential { lifetime } => {
                Ok(Exp::new(lifetime.value(event_index)?.recip())?.sample(rng))
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Interval<T>
where
    T: Clone,
{
    pub(crate) min: T,
    pub(crate) max: T,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Transformation {
    pub(crate) scale: f64,
    pub(crate) translate: f64,
}

impl Transformation {
    pub(crate) fn transform(&self, x: f64) -> f64 {
        x * self.scale + self.translate
    }
}
