//! Formatos de intercambio de fragmentos y tareas.
//!
//! Se aceptan tres formas de fragmento al leer (objeto JSON, query string y
//! elemento XML) y se emite siempre JSON. La lectura es tolerante: un campo
//! que falta o no se entiende toma su valor por defecto.
//!
//! Los timestamps viajan como "ticks": enteros de 100 ns desde la época Unix.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, collections::HashMap, fmt};
use tracing::warn;

use crate::error::WireError;
use crate::fragment::{Fragment, FragmentState};
use crate::task::Task;

pub const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: u32 = 100;

/// Satura en `i64::MAX` / `i64::MIN` para fechas fuera del rango de ticks.
pub fn to_ticks(t: DateTime<Utc>) -> i64 {
    t.timestamp()
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(i64::from(t.timestamp_subsec_nanos() / NANOS_PER_TICK))
}

pub fn from_ticks(ticks: i64) -> DateTime<Utc> {
    let secs = ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) as u32) * NANOS_PER_TICK;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Json,
    Query,
    Xml,
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WireFormat::Json => "json",
            WireFormat::Query => "query",
            WireFormat::Xml => "xml",
        })
    }
}

// claves en minúscula -> valor como texto
type Fields = HashMap<String, String>;

/// Registro plano de un fragmento tal como viaja.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Value")]
pub struct FragmentRecord {
    pub id: String,
    pub index: usize,
    pub state: FragmentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub creation: i64,
    pub update: i64,
}

impl FragmentRecord {
    fn from_fields(fields: &Fields) -> Self {
        let text = |key: &str| {
            fields
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        let ticks = |key: &str| text(key).and_then(|v| v.parse::<i64>().ok());

        let creation = ticks("creation").unwrap_or_else(|| to_ticks(Utc::now()));
        let update = ticks("update")
            .or_else(|| ticks("modification"))
            .unwrap_or(creation);

        Self {
            id: text("id")
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            index: text("index").and_then(|v| v.parse().ok()).unwrap_or(0),
            state: text("state").and_then(|v| v.parse().ok()).unwrap_or_default(),
            tag: text("tag").map(str::to_string),
            creation,
            update,
        }
    }

    pub fn into_fragment(self) -> Fragment {
        Fragment::restore(
            self.id,
            self.index,
            self.state,
            self.tag,
            from_ticks(self.creation),
            from_ticks(self.update),
        )
    }
}

impl From<&Fragment> for FragmentRecord {
    fn from(fragment: &Fragment) -> Self {
        Self {
            id: fragment.id().to_string(),
            index: fragment.index(),
            state: fragment.state(),
            tag: fragment.tag().map(str::to_string),
            creation: to_ticks(fragment.creation()),
            update: to_ticks(fragment.modification()),
        }
    }
}

impl From<Value> for FragmentRecord {
    // cualquier cosa que no sea un objeto queda con todos los valores por defecto
    fn from(value: Value) -> Self {
        let fields: Fields = match value {
            Value::Object(map) => map
                .into_iter()
                .filter_map(|(k, v)| {
                    let text = match v {
                        Value::Null => return None,
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    Some((k.to_ascii_lowercase(), text))
                })
                .collect(),
            _ => Fields::new(),
        };
        Self::from_fields(&fields)
    }
}

/* ---------------- lectura de fragmentos ---------------- */

pub fn parse_fragment(format: WireFormat, input: &str) -> Result<Fragment, WireError> {
    match format {
        WireFormat::Json => parse_json(input),
        WireFormat::Query => Ok(parse_query(input)),
        WireFormat::Xml => parse_xml(input),
    }
}

pub fn parse_json(input: &str) -> Result<Fragment, WireError> {
    let value: Value = serde_json::from_str(input)?;
    if !value.is_object() {
        return Err(WireError::NotAnObject);
    }
    Ok(FragmentRecord::from(value).into_fragment())
}

/// `id=..&index=..&state=..`; nunca falla, como mucho todo queda por defecto.
pub fn parse_query(input: &str) -> Fragment {
    let fields: Fields = input
        .trim()
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (form_decode(k).to_ascii_lowercase(), form_decode(v))
        })
        .collect();
    FragmentRecord::from_fields(&fields).into_fragment()
}

/// Acepta los campos como atributos (`<fragment id=".." state=".."/>`)
/// o como elementos hijos (`<fragment><id>..</id></fragment>`).
pub fn parse_xml(input: &str) -> Result<Fragment, WireError> {
    let fields = xml_fields(input)?;
    Ok(FragmentRecord::from_fields(&fields).into_fragment())
}

/* ---------------- escritura ---------------- */

pub fn to_json(fragment: &Fragment) -> Result<String, WireError> {
    Ok(serde_json::to_string(&FragmentRecord::from(fragment))?)
}

/// Campos propios de [`TaskRecord`]; no pueden usarse como extras.
pub const RESERVED_KEYS: [&str; 8] = [
    "id", "job", "creation", "update", "done", "desc", "fragment", "fragments",
];

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Documento JSON de una tarea.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub job: String,
    pub creation: i64,
    pub update: i64,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<FragmentRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragments: Option<Vec<FragmentRecord>>,
    /// Pares clave/valor extra del llamador, aplanados en el objeto.
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl TaskRecord {
    /// Cabecera de la tarea, sin fragmentos.
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id().to_string(),
            job: task.job_id().to_string(),
            creation: to_ticks(task.created_at()),
            update: to_ticks(task.modification()),
            done: task.is_done(),
            desc: task.description(),
            fragment: None,
            fragments: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_fragment(mut self, fragment: &Fragment) -> Self {
        self.fragment = Some(fragment.into());
        self
    }

    pub fn with_fragments(mut self, fragments: &[Fragment]) -> Self {
        self.fragments = Some(fragments.iter().map(FragmentRecord::from).collect());
        self
    }

    /// Agrega un par extra. Las claves propias del documento se ignoran:
    /// generarían un campo duplicado que después no se puede leer.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if is_reserved_key(&key) {
            warn!(key = %key, "clave extra reservada, se ignora");
            return self;
        }
        self.extra.insert(key, value.into());
        self
    }

    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn parse(input: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(input)?)
    }

    /// Construye una tarea viva con el id, job y fragmentos del documento.
    /// Sólo se usa `fragments`; el `fragment` suelto no forma parte de la partición.
    pub fn into_task(self) -> Task {
        let fragments = self
            .fragments
            .unwrap_or_default()
            .into_iter()
            .map(FragmentRecord::into_fragment)
            .collect();
        Task::restore(self.id, self.job, from_ticks(self.creation), self.desc, fragments)
    }
}

/* ---------------- utilidades ---------------- */

// application/x-www-form-urlencoded: '+' es espacio
fn form_decode(s: &str) -> String {
    let spaced = s.replace('+', " ");
    String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned()
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn xml_error(msg: impl Into<String>) -> WireError {
    WireError::Xml(msg.into())
}

// salta declaración, comentarios y doctype hasta el elemento raíz
fn skip_prolog(mut s: &str) -> Result<&str, WireError> {
    loop {
        s = s.trim_start();
        let end_marker = if s.starts_with("<?") {
            "?>"
        } else if s.starts_with("<!--") {
            "-->"
        } else if s.starts_with("<!") {
            ">"
        } else if s.starts_with('<') {
            return Ok(s);
        } else {
            return Err(xml_error("no se encontró ningún elemento"));
        };
        let end = s
            .find(end_marker)
            .ok_or_else(|| xml_error("prólogo sin cerrar"))?;
        s = &s[end + end_marker.len()..];
    }
}

struct OpenTag<'a> {
    name: String,
    attributes: Fields,
    self_closing: bool,
    rest: &'a str,
}

fn read_open_tag(s: &str) -> Result<OpenTag<'_>, WireError> {
    let mut quote: Option<char> = None;
    let mut end = None;
    for (i, c) in s.char_indices().skip(1) {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '>' => {
                end = Some(i);
                break;
            }
            None => {}
        }
    }
    let end = end.ok_or_else(|| xml_error("etiqueta sin cerrar"))?;

    let mut body = &s[1..end];
    let self_closing = body.ends_with('/');
    if self_closing {
        body = &body[..body.len() - 1];
    }
    let body = body.trim();
    let name_end = body.find(char::is_whitespace).unwrap_or(body.len());
    let name = &body[..name_end];
    if name.is_empty() || name.starts_with('/') {
        return Err(xml_error(format!("etiqueta inválida: <{body}>")));
    }

    Ok(OpenTag {
        name: name.to_string(),
        attributes: parse_attributes(&body[name_end..])?,
        self_closing,
        rest: &s[end + 1..],
    })
}

fn parse_attributes(mut s: &str) -> Result<Fields, WireError> {
    let mut fields = Fields::new();
    loop {
        s = s.trim_start();
        if s.is_empty() {
            return Ok(fields);
        }
        let eq = s
            .find('=')
            .ok_or_else(|| xml_error(format!("atributo sin valor: {s}")))?;
        let key = s[..eq].trim().to_ascii_lowercase();
        let value = s[eq + 1..].trim_start();
        let quote = value
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| xml_error(format!("valor sin comillas en {key}")))?;
        let close = value[1..]
            .find(quote)
            .ok_or_else(|| xml_error(format!("comillas sin cerrar en {key}")))?;
        fields.insert(key, xml_unescape(&value[1..1 + close]));
        s = &value[close + 2..];
    }
}

fn xml_fields(input: &str) -> Result<Fields, WireError> {
    let root = read_open_tag(skip_prolog(input)?)?;
    let mut fields = root.attributes;
    if root.self_closing {
        return Ok(fields);
    }

    let closing = format!("</{}", root.name);
    let mut body = root.rest;
    loop {
        body = body.trim_start();
        if body.is_empty() || body.starts_with(&closing) {
            return Ok(fields);
        }
        if !body.starts_with('<') {
            // texto suelto dentro de la raíz, se ignora
            match body.find('<') {
                Some(pos) => {
                    body = &body[pos..];
                    continue;
                }
                None => return Ok(fields),
            }
        }

        let child = read_open_tag(body)?;
        if child.self_closing {
            body = child.rest;
            continue;
        }
        let end_tag = format!("</{}>", child.name);
        let end = child
            .rest
            .find(&end_tag)
            .ok_or_else(|| xml_error(format!("falta {end_tag}")))?;
        fields.insert(
            child.name.to_ascii_lowercase(),
            xml_unescape(child.rest[..end].trim()),
        );
        body = &child.rest[end + end_tag.len()..];
    }
}
