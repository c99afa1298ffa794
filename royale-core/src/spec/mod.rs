//! Sampling generators for trial inputs.
//!
//! A [`ValueSpec`] produces one [`Value`] per call to
//! [`sample`](ValueSpec::sample). The closed set of generators covers the
//! needs of experiment definitions:
//!
//! - [`constant`](ValueSpec::constant): always the stored value.
//! - [`uniform`](ValueSpec::uniform): a real drawn uniformly from a closed
//!   range.
//! - [`uniform_int`](ValueSpec::uniform_int): an integer drawn uniformly
//!   from an inclusive range.
//! - [`choose`](ValueSpec::choose): one option picked uniformly, then
//!   sampled recursively. Choosing among zero options yields the sentinel
//!   string `"<empty>"`.
//!
//! Beyond the closed set, [`register_custom`] installs user-defined spec
//! types by name, so that serialized experiments can refer to generators the
//! library does not know about.
//!
//! # Seeding
//!
//! Each randomized generator owns its own PRNG. Without a seed the PRNG is
//! initialized from OS entropy at construction; with a seed
//! ([`with_seed`](ValueSpec::with_seed)) the sample sequence is deterministic
//! and restarts from the seed every time the spec is deserialized. The PRNG
//! is [`StdRng`] seeded through `seed_from_u64`, so two identically-seeded
//! generators agree forever, on every platform the `rand` crate supports.
//!
//! # Wire format
//!
//! The full form is a single-key object tagged by type name, e.g.
//! `{"Uniform": {"range": [1.0, 10.5], "seed": 0}}`. Short-hands are
//! recognized on deserialization and emitted whenever no seed needs to be
//! preserved:
//!
//! - a bare number or string is a `Constant`;
//! - a two-element all-numeric array is a `Uniform` over that range;
//! - any other array is a `Choose` over recursively-parsed options.
//!
//! A bare two-element numeric array always parses as `Uniform`, never as
//! `UniformInt` nor as a two-option numeric `Choose`; the latter two require
//! the full object form.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;

use crate::value::Value;

/// The sentinel produced by a `Choose` with no options.
pub const EMPTY_CHOICE: &str = "<empty>";

/// A polymorphic sampling generator.
#[derive(Debug, Clone)]
pub enum ValueSpec {
    Constant(Constant),
    Uniform(Uniform),
    UniformInt(UniformInt),
    Choose(Choose),
    Custom(Custom),
}

#[derive(Debug, Clone)]
pub struct Constant {
    val: Value,
}

#[derive(Debug, Clone)]
pub struct Uniform {
    range: [f64; 2],
    seed: Option<u64>,
    rng: StdRng,
}

#[derive(Debug, Clone)]
pub struct UniformInt {
    range: [i64; 2],
    seed: Option<u64>,
    rng: StdRng,
}

#[derive(Debug, Clone)]
pub struct Choose {
    options: Vec<ValueSpec>,
    seed: Option<u64>,
    rng: StdRng,
}

/// A registered user-defined spec, carrying its original payload so that
/// serialization round-trips.
#[derive(Clone)]
pub struct Custom {
    name: String,
    payload: Json,
    sampler: Arc<dyn CustomSample>,
}

impl std::fmt::Debug for Custom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Custom")
            .field("name", &self.name)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Sampling behavior of a user-registered spec type.
///
/// Implementations needing mutable generator state should carry it behind
/// interior mutability; the built-in specs keep their PRNGs inline instead.
pub trait CustomSample: Send + Sync {
    fn sample(&self) -> Value;
}

type CustomCtor = Arc<dyn Fn(&Json) -> Result<Arc<dyn CustomSample>> + Send + Sync>;

fn custom_registry() -> &'static RwLock<HashMap<String, CustomCtor>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, CustomCtor>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// Registers a spec type under `name`. The constructor receives the JSON
/// payload found under the type tag and returns the sampler to use.
/// Re-registering a name replaces the previous constructor.
pub fn register_custom<F>(name: &str, ctor: F)
where
    F: Fn(&Json) -> Result<Arc<dyn CustomSample>> + Send + Sync + 'static,
{
    custom_registry()
        .write()
        .expect("custom spec registry poisoned")
        .insert(name.to_string(), Arc::new(ctor));
}

fn lookup_custom(name: &str) -> Option<CustomCtor> {
    custom_registry()
        .read()
        .expect("custom spec registry poisoned")
        .get(name)
        .cloned()
}

fn rng_for(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

impl ValueSpec {
    /// A spec that always samples to `val`.
    pub fn constant(val: impl Into<Value>) -> Self {
        ValueSpec::Constant(Constant { val: val.into() })
    }

    /// A real drawn uniformly from the closed range `[lo, hi]`.
    pub fn uniform(lo: f64, hi: f64) -> Self {
        ValueSpec::Uniform(Uniform {
            range: [lo, hi],
            seed: None,
            rng: rng_for(None),
        })
    }

    /// An integer drawn uniformly from the inclusive range `[lo, hi]`.
    pub fn uniform_int(lo: i64, hi: i64) -> Self {
        ValueSpec::UniformInt(UniformInt {
            range: [lo, hi],
            seed: None,
            rng: rng_for(None),
        })
    }

    /// One of `options`, picked uniformly and then sampled recursively.
    pub fn choose(options: impl IntoIterator<Item = ValueSpec>) -> Self {
        ValueSpec::Choose(Choose {
            options: options.into_iter().collect(),
            seed: None,
            rng: rng_for(None),
        })
    }

    /// Instantiates a registered custom spec with an empty payload.
    pub fn custom(name: &str) -> Result<Self> {
        Self::custom_with_payload(name, Json::Object(Default::default()))
    }

    fn custom_with_payload(name: &str, payload: Json) -> Result<Self> {
        let ctor =
            lookup_custom(name).ok_or_else(|| anyhow!("unknown value spec type: {name:?}"))?;
        let sampler = ctor(&payload)
            .with_context(|| format!("constructing custom value spec {name:?}"))?;
        Ok(ValueSpec::Custom(Custom {
            name: name.to_string(),
            payload,
            sampler,
        }))
    }

    /// Seeds the generator, restarting its sample sequence. No effect on
    /// `Constant` and `Custom` specs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        match &mut self {
            ValueSpec::Uniform(u) => {
                u.seed = Some(seed);
                u.rng = rng_for(Some(seed));
            }
            ValueSpec::UniformInt(u) => {
                u.seed = Some(seed);
                u.rng = rng_for(Some(seed));
            }
            ValueSpec::Choose(c) => {
                c.seed = Some(seed);
                c.rng = rng_for(Some(seed));
            }
            ValueSpec::Constant(_) | ValueSpec::Custom(_) => {}
        }
        self
    }

    /// Draws the next value, advancing the generator state.
    pub fn sample(&mut self) -> Value {
        match self {
            ValueSpec::Constant(c) => c.val.clone(),
            ValueSpec::Uniform(u) => {
                Value::Number(u.rng.gen_range(u.range[0]..=u.range[1]))
            }
            ValueSpec::UniformInt(u) => {
                Value::Number(u.rng.gen_range(u.range[0]..=u.range[1]) as f64)
            }
            ValueSpec::Choose(c) => {
                if c.options.is_empty() {
                    Value::String(EMPTY_CHOICE.to_string())
                } else {
                    let i = c.rng.gen_range(0..c.options.len());
                    c.options[i].sample()
                }
            }
            ValueSpec::Custom(c) => c.sampler.sample(),
        }
    }

    /// The wire tag of this spec.
    pub fn type_name(&self) -> &str {
        match self {
            ValueSpec::Constant(_) => "Constant",
            ValueSpec::Uniform(_) => "Uniform",
            ValueSpec::UniformInt(_) => "UniformInt",
            ValueSpec::Choose(_) => "Choose",
            ValueSpec::Custom(c) => &c.name,
        }
    }

    fn from_json(j: &Json) -> Result<Self> {
        match j {
            Json::Number(n) => Ok(Self::constant(
                n.as_f64().context("value spec number is not representable")?,
            )),
            Json::String(s) => Ok(Self::constant(s.as_str())),
            Json::Array(items) => {
                if items.len() == 2 && items.iter().all(Json::is_number) {
                    let lo = items[0].as_f64().unwrap();
                    let hi = items[1].as_f64().unwrap();
                    Ok(Self::uniform(lo, hi))
                } else {
                    let options = items
                        .iter()
                        .map(Self::from_json)
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Self::choose(options))
                }
            }
            Json::Object(map) if map.len() == 1 => {
                let (tag, payload) = map.iter().next().unwrap();
                Self::from_tagged(tag, payload)
            }
            other => bail!("unrecognized value spec: {other}"),
        }
    }

    fn from_tagged(tag: &str, payload: &Json) -> Result<Self> {
        match tag {
            "Constant" => {
                let val = payload.get("val").unwrap_or(payload);
                match val {
                    Json::Number(n) => Ok(Self::constant(
                        n.as_f64().context("constant is not representable")?,
                    )),
                    Json::String(s) => Ok(Self::constant(s.as_str())),
                    other => bail!("constant payload must be a number or string: {other}"),
                }
            }
            "Uniform" => {
                let form = RangeForm::<f64>::parse(payload).context("parsing Uniform spec")?;
                let spec = Self::uniform(form.range[0], form.range[1]);
                Ok(match form.seed {
                    Some(seed) => spec.with_seed(seed),
                    None => spec,
                })
            }
            "UniformInt" => {
                let form = RangeForm::<i64>::parse(payload).context("parsing UniformInt spec")?;
                let spec = Self::uniform_int(form.range[0], form.range[1]);
                Ok(match form.seed {
                    Some(seed) => spec.with_seed(seed),
                    None => spec,
                })
            }
            "Choose" => {
                let (options, seed) = match payload {
                    Json::Array(items) => (items.as_slice(), None),
                    Json::Object(fields) => {
                        let options = fields
                            .get("options")
                            .and_then(Json::as_array)
                            .map(Vec::as_slice)
                            .unwrap_or_default();
                        let seed = fields.get("seed").and_then(Json::as_u64);
                        (options, seed)
                    }
                    other => bail!("choose payload must be an array or object: {other}"),
                };
                let options = options
                    .iter()
                    .map(Self::from_json)
                    .collect::<Result<Vec<_>>>()?;
                let spec = Self::choose(options);
                Ok(match seed {
                    Some(seed) => spec.with_seed(seed),
                    None => spec,
                })
            }
            name => Self::custom_with_payload(name, payload.clone()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RangeForm<T> {
    range: [T; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

impl<T: Copy + serde::de::DeserializeOwned> RangeForm<T> {
    fn parse(payload: &Json) -> Result<Self> {
        Ok(serde_json::from_value(payload.clone())?)
    }
}

#[derive(Serialize)]
struct ChooseForm<'a> {
    options: &'a [ValueSpec],
    seed: u64,
}

impl Serialize for ValueSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ValueSpec::Constant(c) => c.val.serialize(serializer),
            ValueSpec::Uniform(u) => match u.seed {
                None => u.range.serialize(serializer),
                Some(_) => tagged(serializer, "Uniform", &RangeForm { range: u.range, seed: u.seed }),
            },
            ValueSpec::UniformInt(u) => match u.seed {
                None => u.range.serialize(serializer),
                Some(_) => {
                    tagged(serializer, "UniformInt", &RangeForm { range: u.range, seed: u.seed })
                }
            },
            ValueSpec::Choose(c) => match c.seed {
                None => c.options.serialize(serializer),
                Some(seed) => {
                    tagged(serializer, "Choose", &ChooseForm { options: &c.options, seed })
                }
            },
            ValueSpec::Custom(c) => tagged(serializer, &c.name, &c.payload),
        }
    }
}

fn tagged<S: Serializer, T: Serialize>(
    serializer: S,
    tag: &str,
    payload: &T,
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(1))?;
    map.serialize_entry(tag, payload)?;
    map.end()
}

impl<'de> Deserialize<'de> for ValueSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let j = Json::deserialize(deserializer)?;
        ValueSpec::from_json(&j).map_err(D::Error::custom)
    }
}
