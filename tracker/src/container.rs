use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fragment::{Fragment, FragmentMut, FragmentState};
use crate::task::{Task, TaskEvent, TaskId};
use crate::JobId;

const EVENT_CAPACITY: usize = 256;

/// Eventos de alto nivel del contenedor (fan-out vía broadcast).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    TaskCreated {
        group: String,
        task_id: TaskId,
        job_id: JobId,
    },
    /// Sacada del grupo al completarse (auto-remove).
    TaskEvicted { group: String, task_id: TaskId },
    /// Sacada del grupo con [`Container::remove`].
    TaskRemoved { group: String, task_id: TaskId },
}

enum Layout {
    Count(usize),
    Fragments(Vec<Fragment>),
}

/// Parámetros para [`Container::create_with`].
pub struct NewTask {
    job_id: JobId,
    layout: Layout,
    description: Option<String>,
    auto_remove: bool,
}

impl NewTask {
    pub fn new(job_id: impl Into<JobId>, count: usize) -> Self {
        Self {
            job_id: job_id.into(),
            layout: Layout::Count(count),
            description: None,
            auto_remove: true,
        }
    }

    /// La tarea adopta estos fragmentos en lugar de generar nuevos.
    pub fn adopt(job_id: impl Into<JobId>, fragments: Vec<Fragment>) -> Self {
        Self {
            layout: Layout::Fragments(fragments),
            ..Self::new(job_id, 0)
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    fn build(self) -> (Task, bool) {
        let mut task = match self.layout {
            Layout::Count(count) => Task::new(self.job_id, count),
            Layout::Fragments(fragments) => Task::from_fragments(self.job_id, fragments),
        };
        if let Some(description) = self.description {
            task = task.with_description(description);
        }
        (task, self.auto_remove)
    }
}

/// Tarea junto con uno de sus fragmentos (resultado de pick / búsqueda).
#[derive(Debug, Clone)]
pub struct TaskFragment {
    pub task: Arc<Task>,
    pub fragment: Fragment,
}

struct Shared {
    groups: RwLock<HashMap<String, Vec<Arc<Task>>>>,
    events: broadcast::Sender<ContainerEvent>,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Vec<Arc<Task>>>> {
        self.groups.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Vec<Arc<Task>>>> {
        self.groups.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn detach(&self, group: &str, task_id: &str) -> bool {
        let mut groups = self.write();
        let Some(tasks) = groups.get_mut(group) else {
            return false;
        };
        let before = tasks.len();
        tasks.retain(|t| t.id() != task_id);
        let removed = tasks.len() != before;
        if tasks.is_empty() {
            groups.remove(group);
        }
        removed
    }

    fn evict(&self, group: &str, task_id: &str) {
        if self.detach(group, task_id) {
            info!(group, task_id, "tarea terminada, sacada del grupo");
            // sin suscriptores send falla, y está bien
            let _ = self.events.send(ContainerEvent::TaskEvicted {
                group: group.to_string(),
                task_id: task_id.to_string(),
            });
        }
    }
}

/// Tareas agrupadas por un identificador de grupo opaco.
///
/// Es barato de clonar; todos los clones comparten el mismo estado.
/// El lock del contenedor nunca se mantiene mientras corre una operación de
/// una tarea: se toma una copia de la lista del grupo y se libera.
#[derive(Clone)]
pub struct Container {
    shared: Arc<Shared>,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl Container {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                groups: RwLock::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.shared.events.subscribe()
    }

    /// Crea una tarea de `count` fragmentos en `group`, con auto-remove.
    pub fn create(&self, group: &str, job_id: impl Into<JobId>, count: usize) -> Arc<Task> {
        self.create_with(group, NewTask::new(job_id, count))
    }

    pub fn create_with(&self, group: &str, new_task: NewTask) -> Arc<Task> {
        let (task, auto_remove) = new_task.build();
        let task = Arc::new(task);
        self.register(group, Arc::clone(&task), auto_remove);
        task
    }

    /// Registra una tarea construida fuera del contenedor.
    ///
    /// Con `auto_remove` una tarea que ya está terminada no se registra:
    /// nunca emitiría el evento de completado que la sacaría del grupo.
    pub fn register(&self, group: &str, task: Arc<Task>, auto_remove: bool) {
        if auto_remove {
            if task.is_done() {
                debug!(group, task_id = task.id(), "tarea ya terminada, no se registra");
                self.announce(group, &task);
                return;
            }

            let weak = Arc::downgrade(&self.shared);
            let group_name = group.to_string();
            task.subscribe(move |event| {
                if let TaskEvent::Completed { task_id } = event {
                    if let Some(shared) = weak.upgrade() {
                        shared.evict(&group_name, task_id);
                    }
                }
            });
        }

        self.shared
            .write()
            .entry(group.to_string())
            .or_default()
            .push(Arc::clone(&task));

        info!(
            group,
            task_id = task.id(),
            job_id = task.job_id(),
            fragments = task.len(),
            "tarea registrada"
        );
        self.announce(group, &task);

        // pudo completarse entre la suscripción y el insert
        if auto_remove && task.is_done() {
            self.shared.evict(group, task.id());
        }
    }

    fn announce(&self, group: &str, task: &Task) {
        let _ = self.shared.events.send(ContainerEvent::TaskCreated {
            group: group.to_string(),
            task_id: task.id().to_string(),
            job_id: task.job_id().to_string(),
        });
    }

    /// Saca una tarea del grupo a mano. No la cancela.
    pub fn remove(&self, group: &str, task_id: &str) -> bool {
        let removed = self.shared.detach(group, task_id);
        if removed {
            let _ = self.shared.events.send(ContainerEvent::TaskRemoved {
                group: group.to_string(),
                task_id: task_id.to_string(),
            });
        }
        removed
    }

    fn snapshot(&self, group: &str) -> Vec<Arc<Task>> {
        self.shared.read().get(group).cloned().unwrap_or_default()
    }

    pub fn groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Todas las tareas registradas en el grupo, terminadas o no.
    pub fn tasks(&self, group: &str) -> Vec<Arc<Task>> {
        self.snapshot(group)
    }

    /// Tareas todavía no terminadas del grupo. Grupo desconocido: vacío.
    pub fn list(&self, group: &str) -> Vec<Arc<Task>> {
        self.list_with(group, |_| true, None)
    }

    pub fn list_with<P>(&self, group: &str, predicate: P, limit: Option<usize>) -> Vec<Arc<Task>>
    where
        P: Fn(&Task) -> bool,
    {
        self.snapshot(group)
            .into_iter()
            .filter(|task| !task.is_done() && predicate(task))
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    pub fn find_task(&self, task_id: &str) -> Option<Arc<Task>> {
        self.shared
            .read()
            .values()
            .flatten()
            .find(|t| t.id() == task_id)
            .cloned()
    }

    pub fn get_task(&self, task_id: &str) -> Result<Arc<Task>> {
        self.find_task(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))
    }

    /// Pide un fragmento a las tareas del grupo, en orden, hasta que una lo da.
    pub fn pick(&self, group: &str) -> Option<TaskFragment> {
        self.pick_with(group, |_| true, |task| task.pick())
    }

    pub fn pick_with<P, F>(&self, group: &str, predicate: P, mut pick_fn: F) -> Option<TaskFragment>
    where
        P: Fn(&Task) -> bool,
        F: FnMut(&Task) -> Option<Fragment>,
    {
        self.list_with(group, predicate, None)
            .into_iter()
            .find_map(|task| {
                let fragment = pick_fn(&task)?;
                Some(TaskFragment { task, fragment })
            })
    }

    pub fn get_fragment(&self, group: &str, fragment_id: &str) -> Option<TaskFragment> {
        self.snapshot(group).into_iter().find_map(|task| {
            let fragment = task.try_get(fragment_id)?;
            Some(TaskFragment { task, fragment })
        })
    }

    pub fn update_fragment(&self, group: &str, fragment_id: &str, state: Option<FragmentState>) -> bool {
        self.update_fragment_with(group, fragment_id, state, |_| {})
    }

    /// Busca la tarea dueña del fragmento y le delega el update.
    pub fn update_fragment_with<F>(
        &self,
        group: &str,
        fragment_id: &str,
        state: Option<FragmentState>,
        callback: F,
    ) -> bool
    where
        F: FnOnce(&mut FragmentMut<'_>),
    {
        match self
            .snapshot(group)
            .into_iter()
            .find(|task| task.contains(fragment_id))
        {
            Some(task) => task.update_fragment_with(fragment_id, state, callback),
            None => false,
        }
    }

    /// Cancela todas las tareas del grupo. Devuelve los fragmentos afectados.
    pub fn cancel_group(&self, group: &str) -> usize {
        self.snapshot(group).iter().map(|task| task.cancel()).sum()
    }
}
