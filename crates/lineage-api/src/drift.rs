use lineage_core::{Development, Evolver, GenerationRng, Genome, Individual, LineageError};
use rand::Rng;
use serde_json::{Number, Value};

/// Stand-in evolutionary algorithm bundled so the binaries run end to end.
///
/// Every offspring is the developed parent with each numeric leaf nudged by a
/// generator-drawn amount; strings, booleans, and nulls are inherited as-is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftEvolver {
    pub integer_step: i64,
    pub float_scale: f64,
}

impl Default for DriftEvolver {
    fn default() -> Self {
        Self { integer_step: 1, float_scale: 0.1 }
    }
}

impl Evolver for DriftEvolver {
    fn evolve(
        &self,
        parent: &Genome,
        development: Development,
        rng: &mut GenerationRng,
        count: usize,
    ) -> Result<Vec<Individual>, LineageError> {
        let developed = development(parent);
        let offspring = (0..count)
            .map(|_| {
                let mut genes = developed.genotype.as_value().clone();
                self.drift(&mut genes, rng);
                development(&Genome::new(genes))
            })
            .collect();
        Ok(offspring)
    }
}

impl DriftEvolver {
    fn drift(&self, value: &mut Value, rng: &mut GenerationRng) {
        match value {
            Value::Number(number) => {
                if let Some(drifted) = self.drift_number(number, rng) {
                    *number = drifted;
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.drift(item, rng);
                }
            }
            Value::Object(fields) => {
                for field in fields.values_mut() {
                    self.drift(field, rng);
                }
            }
            Value::Null | Value::Bool(_) | Value::String(_) => {}
        }
    }

    fn drift_number(&self, number: &Number, rng: &mut GenerationRng) -> Option<Number> {
        if let Some(integer) = number.as_i64() {
            let step = self.integer_step.max(0);
            return Some(Number::from(integer.saturating_add(rng.gen_range(-step..=step))));
        }
        if let Some(unsigned) = number.as_u64() {
            let step = self.integer_step.max(0);
            return Some(Number::from(unsigned.saturating_add_signed(rng.gen_range(-step..=step))));
        }
        let float = number.as_f64()?;
        Number::from_f64(float + rng.gen_range(-1.0..=1.0) * self.float_scale)
    }
}
