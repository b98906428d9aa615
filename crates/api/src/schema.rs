//! Action descriptors and argument checking.
//!
//! [`Args::check`] enforces the shape an [`ActionSpec`] declares (known
//! names, JSON types, required values, defaults). The typed accessors layer
//! the domain rules on top (DNS names, positive windows, replica bounds).

use korral_core::{validate_namespace, ResourceRef, ValidationError, DEFAULT_NAMESPACE};
use serde::Serialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
}

impl ParamType {
    pub fn json_type(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
        }
    }

    fn accepts(self, v: &Value) -> bool {
        match self {
            ParamType::String => v.is_string(),
            ParamType::Integer => v.is_i64() || v.is_u64() || v.as_f64().map_or(false, |f| f.is_finite() && f.fract() == 0.0),
            ParamType::Number => v.is_number(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub ty: ParamType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub description: &'static str,
}

impl ParamSpec {
    pub fn required(name: &'static str, ty: ParamType, description: &'static str) -> Self {
        Self { name, ty, required: true, default: None, description }
    }

    pub fn optional(name: &'static str, ty: ParamType, default: Option<Value>, description: &'static str) -> Self {
        Self { name, ty, required: false, default, description }
    }

    pub fn namespace() -> Self {
        Self::optional("namespace", ParamType::String, Some(json!(DEFAULT_NAMESPACE)), "Kubernetes namespace")
    }

    pub fn deployment_name() -> Self {
        Self::required("deployment_name", ParamType::String, "Name of the deployment")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Safety {
    ReadOnly,
    Mutating,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
    pub safety: Safety,
}

impl ActionSpec {
    pub fn is_mutating(&self) -> bool {
        self.safety == Safety::Mutating
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// JSON Schema object for tool binding.
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.params {
            let ty = if !p.required && p.default.is_none() { json!([p.ty.json_type(), "null"]) } else { json!(p.ty.json_type()) };
            let mut prop = json!({ "type": ty, "description": p.description });
            if let Some(d) = &p.default {
                prop["default"] = d.clone();
            }
            properties.insert(p.name.to_string(), prop);
        }
        let required: Vec<&str> = self.params.iter().filter(|p| p.required).map(|p| p.name).collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}

/// Arguments that passed [`Args::check`]: every declared parameter with a
/// value or default is present, nothing undeclared is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: Map<String, Value>,
}

impl Args {
    pub fn check(spec: &ActionSpec, raw: Value) -> Result<Self, ValidationError> {
        let mut given = match raw {
            Value::Null => Map::new(),
            Value::Object(m) => m,
            other => return Err(ValidationError::new("args", format!("expected a JSON object, got {}", type_name(&other)))),
        };
        if let Some(unknown) = given.keys().find(|k| spec.param(k).is_none()) {
            let known: Vec<&str> = spec.params.iter().map(|p| p.name).collect();
            return Err(ValidationError::new(unknown.as_str(), format!("unknown parameter for {}; expected one of: {}", spec.name, known.join(", "))));
        }
        let mut values = Map::new();
        for p in &spec.params {
            match given.remove(p.name).filter(|v| !v.is_null()) {
                Some(v) if p.ty.accepts(&v) => {
                    values.insert(p.name.to_string(), v);
                }
                Some(v) => {
                    return Err(ValidationError::new(p.name, format!("expected {}, got {}", p.ty.json_type(), type_name(&v))));
                }
                None => match &p.default {
                    Some(d) => {
                        values.insert(p.name.to_string(), d.clone());
                    }
                    None if p.required => return Err(ValidationError::new(p.name, "is required")),
                    None => {}
                },
            }
        }
        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    /// Integral values, including whole floats such as `3.0`.
    pub fn i64(&self, name: &str) -> Option<i64> {
        self.values.get(name).and_then(integral)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(Value::as_f64)
    }

    pub fn namespace(&self) -> Result<&str, ValidationError> {
        let ns = self.str("namespace").unwrap_or(DEFAULT_NAMESPACE);
        validate_namespace(ns)?;
        Ok(ns)
    }

    pub fn namespace_ref(&self) -> Result<ResourceRef, ValidationError> {
        ResourceRef::namespace(self.namespace()?)
    }

    pub fn deployment(&self) -> Result<ResourceRef, ValidationError> {
        let name = self.str("deployment_name").ok_or_else(|| ValidationError::new("deployment_name", "is required"))?;
        ResourceRef::deployment(self.namespace()?, name)
    }

    /// Log window in hours: finite and strictly positive.
    pub fn hours(&self) -> Result<f64, ValidationError> {
        let h = self.f64("hours").unwrap_or(1.0);
        if !h.is_finite() || h <= 0.0 {
            return Err(ValidationError::new("hours", format!("must be a positive number, got {}", h)));
        }
        Ok(h)
    }

    pub fn tail_lines(&self) -> Result<Option<i64>, ValidationError> {
        match self.get("tail_lines") {
            None => Ok(None),
            Some(v) => match integral(v) {
                Some(n) if n >= 0 => Ok(Some(n)),
                _ => Err(ValidationError::new("tail_lines", format!("must be a non-negative integer, got {}", v))),
            },
        }
    }

    pub fn replicas(&self, max: i32) -> Result<i32, ValidationError> {
        let v = self.get("replicas").ok_or_else(|| ValidationError::new("replicas", "is required"))?;
        let n = integral(v).ok_or_else(|| ValidationError::new("replicas", format!("must be an integer, got {}", v)))?;
        if n < 0 {
            return Err(ValidationError::new("replicas", format!("must be >= 0, got {}", n)));
        }
        if n > i64::from(max) {
            return Err(ValidationError::new("replicas", format!("must be <= {}, got {}", max, n)));
        }
        i32::try_from(n).map_err(|_| ValidationError::new("replicas", format!("out of range: {}", n)))
    }
}

/// Most specific well-formed target derivable from raw arguments, for
/// envelopes that fail before validation completes.
pub fn best_effort_target(raw: &Value) -> ResourceRef {
    let ns = raw.get("namespace").and_then(Value::as_str).unwrap_or(DEFAULT_NAMESPACE);
    raw.get("deployment_name")
        .and_then(Value::as_str)
        .and_then(|name| ResourceRef::deployment(ns, name).ok())
        .or_else(|| ResourceRef::namespace(ns).ok())
        .unwrap_or_else(ResourceRef::default_namespace)
}

fn integral(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| {
        v.as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
