use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::WireError;

pub type FragmentId = String;

/// Estado de un fragmento dentro de su tarea.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentState {
    #[default]
    Pending,
    Working,
    Success,
    Failure,
    Retrying,
    Fatal,
    Ignored,
}

impl FragmentState {
    pub const ALL: [FragmentState; 7] = [
        FragmentState::Pending,
        FragmentState::Working,
        FragmentState::Success,
        FragmentState::Failure,
        FragmentState::Retrying,
        FragmentState::Fatal,
        FragmentState::Ignored,
    ];

    /// Algún worker lo tiene asignado (Working / Retrying).
    pub fn is_processing(self) -> bool {
        matches!(self, FragmentState::Working | FragmentState::Retrying)
    }

    /// Disponible para un pick sin estado explícito (Pending / Failure).
    pub fn is_waiting(self) -> bool {
        matches!(self, FragmentState::Pending | FragmentState::Failure)
    }

    /// Estado terminal: ya no admite transiciones.
    pub fn is_done(self) -> bool {
        matches!(
            self,
            FragmentState::Success | FragmentState::Fatal | FragmentState::Ignored
        )
    }

    pub fn is_error(self) -> bool {
        matches!(self, FragmentState::Failure | FragmentState::Fatal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FragmentState::Pending => "pending",
            FragmentState::Working => "working",
            FragmentState::Success => "success",
            FragmentState::Failure => "failure",
            FragmentState::Retrying => "retrying",
            FragmentState::Fatal => "fatal",
            FragmentState::Ignored => "ignored",
        }
    }
}

impl fmt::Display for FragmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FragmentState {
    type Err = WireError;

    // sin distinguir mayúsculas: "Working", "WORKING" y "working" valen igual
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        FragmentState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| WireError::UnknownState(wanted.to_string()))
    }
}

/// Una unidad de trabajo de un job particionado.
///
/// `id` e `index` no cambian nunca; estado y tag sólo se modifican
/// a través de las operaciones de [`crate::Task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    id: FragmentId,
    index: usize,
    state: FragmentState,
    tag: Option<String>,
    creation: DateTime<Utc>,
    modification: DateTime<Utc>,
}

impl Fragment {
    /// Fragmento nuevo en `Pending` con id generado.
    pub fn new(index: usize) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), index)
    }

    pub fn with_id(id: impl Into<FragmentId>, index: usize) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            index,
            state: FragmentState::Pending,
            tag: None,
            creation: now,
            modification: now,
        }
    }

    /// Reconstruye un fragmento existente (por ejemplo leído de su formato de intercambio).
    /// Si `modification` es anterior a `creation` se iguala a `creation`.
    pub fn restore(
        id: impl Into<FragmentId>,
        index: usize,
        state: FragmentState,
        tag: Option<String>,
        creation: DateTime<Utc>,
        modification: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            index,
            state,
            tag,
            creation,
            modification: modification.max(creation),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> FragmentState {
        self.state
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn creation(&self) -> DateTime<Utc> {
        self.creation
    }

    pub fn modification(&self) -> DateTime<Utc> {
        self.modification
    }

    pub(crate) fn touch(&mut self) {
        // nunca hacia atrás, aunque el reloj retroceda
        let now = Utc::now();
        if now > self.modification {
            self.modification = now;
        }
    }

    pub(crate) fn transition(&mut self, state: FragmentState) {
        self.state = state;
        self.touch();
    }
}

/// Acceso mutable a un fragmento mientras la tarea tiene su lock tomado.
///
/// Es lo que reciben los callbacks de `pick` / `update_fragment`.
pub struct FragmentMut<'a> {
    fragment: &'a mut Fragment,
}

impl<'a> FragmentMut<'a> {
    pub(crate) fn new(fragment: &'a mut Fragment) -> Self {
        Self { fragment }
    }

    pub fn id(&self) -> &str {
        self.fragment.id()
    }

    pub fn index(&self) -> usize {
        self.fragment.index()
    }

    pub fn state(&self) -> FragmentState {
        self.fragment.state()
    }

    pub fn tag(&self) -> Option<&str> {
        self.fragment.tag()
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.fragment.tag = Some(tag.into());
        self.fragment.touch();
    }

    pub fn clear_tag(&mut self) {
        self.fragment.tag = None;
        self.fragment.touch();
    }

    /// Fuerza un estado sin pasar por la tabla de transiciones.
    pub fn set_state(&mut self, state: FragmentState) {
        self.fragment.transition(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicados_de_estado_siguen_la_tabla() {
        use FragmentState::*;

        // (estado, processing, waiting, done, error)
        let table = [
            (Pending, false, true, false, false),
            (Working, true, false, false, false),
            (Failure, false, true, false, true),
            (Retrying, true, false, false, false),
            (Success, false, false, true, false),
            (Fatal, false, false, true, true),
            (Ignored, false, false, true, false),
        ];

        for (state, processing, waiting, done, error) in table {
            assert_eq!(state.is_processing(), processing, "{state}");
            assert_eq!(state.is_waiting(), waiting, "{state}");
            assert_eq!(state.is_done(), done, "{state}");
            assert_eq!(state.is_error(), error, "{state}");
        }
    }

    #[test]
    fn from_str_ignora_mayusculas() {
        assert_eq!("Working".parse::<FragmentState>().unwrap(), FragmentState::Working);
        assert_eq!(" FATAL ".parse::<FragmentState>().unwrap(), FragmentState::Fatal);
        assert!("desconocido".parse::<FragmentState>().is_err());
    }

    #[test]
    fn fragmento_nuevo_esta_pending_y_sin_tag() {
        let f = Fragment::new(4);
        assert_eq!(f.index(), 4);
        assert_eq!(f.state(), FragmentState::Pending);
        assert!(f.tag().is_none());
        assert!(!f.id().is_empty());
        assert_eq!(f.creation(), f.modification());
    }

    #[test]
    fn restore_no_deja_modification_antes_de_creation() {
        let creation = Utc::now();
        let earlier = creation - chrono::Duration::seconds(10);
        let f = Fragment::restore("x", 0, FragmentState::Success, None, creation, earlier);
        assert_eq!(f.modification(), creation);
    }

    #[test]
    fn fragment_mut_actualiza_modification() {
        let mut f = Fragment::with_id("a", 0);
        let before = f.modification();
        {
            let mut handle = FragmentMut::new(&mut f);
            handle.set_tag("worker-1");
            handle.set_state(FragmentState::Working);
        }
        assert_eq!(f.tag(), Some("worker-1"));
        assert_eq!(f.state(), FragmentState::Working);
        assert!(f.modification() >= before);
        assert!(f.modification() >= f.creation());
    }
}
