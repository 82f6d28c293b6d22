use std::any::Any;

use hashbrown::HashMap;
use tracing::{debug, debug_span, error, info, trace, warn};

use super::{
    association::AssociationTable,
    registry::Registry,
    status::StatusReport,
    wire::{Command, Payload, Reply},
};
use crate::{
    config::PmiConfig, error::Failure, transport::Transport, ClassId, Error, MethodId, ObjectId,
    Rank, NOT_ASSOCIATED,
};

struct LiveObject {
    class_id: ClassId,
    instance: Box<dyn Any>,
}

/// The mirrors living on one rank, keyed by object id.
#[derive(Default)]
pub struct ObjectTable {
    objects: HashMap<ObjectId, LiveObject>,
    /// Lowest id a `Create` may still use; ids are never reused.
    next: ObjectId,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &mut self,
        object_id: ObjectId,
        class_id: ClassId,
        instance: Box<dyn Any>,
    ) -> Result<(), Failure> {
        if self.objects.contains_key(&object_id) {
            return Err(Failure::Internal(format!(
                "has object id {object_id} already defined"
            )));
        }
        if object_id < self.next || object_id == NOT_ASSOCIATED {
            return Err(Failure::Internal(format!(
                "object id {object_id} was already used, next fresh id is {}",
                self.next
            )));
        }
        self.next = object_id + 1;
        self.objects.insert(object_id, LiveObject { class_id, instance });
        Ok(())
    }

    fn get_mut(
        &mut self,
        object_id: ObjectId,
        class_id: ClassId,
    ) -> Result<&mut Box<dyn Any>, Failure> {
        let object = self.objects.get_mut(&object_id).ok_or_else(|| {
            Failure::Internal(format!(
                "does not have an initialized object at object id {object_id}"
            ))
        })?;
        if object.class_id != class_id {
            return Err(Failure::Internal(format!(
                "object id {object_id} has class id {}, command names class id {class_id}",
                object.class_id
            )));
        }
        Ok(&mut object.instance)
    }

    fn remove(&mut self, object_id: ObjectId, class_id: ClassId) -> Result<(), Failure> {
        self.get_mut(object_id, class_id)?;
        self.objects.remove(&object_id);
        Ok(())
    }

    /// Live ids in ascending order.
    pub fn ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<_> = self.objects.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// What a worker did before it was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerSummary {
    pub rank: Rank,
    /// Commands handled, the final `Stop` included.
    pub commands: u64,
    /// Objects still alive when `Stop` arrived.
    pub objects_left: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    Stop,
}

/// The dispatch loop of a non-controller rank.
pub struct Worker {
    transport: Box<dyn Transport>,
    registry: Registry,
    config: PmiConfig,
    associations: AssociationTable,
    objects: ObjectTable,
    handled: u64,
}

impl Worker {
    pub fn new(transport: Box<dyn Transport>, registry: Registry, config: PmiConfig) -> Self {
        Worker {
            transport,
            registry,
            config,
            associations: AssociationTable::new(),
            objects: ObjectTable::new(),
            handled: 0,
        }
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    /// Handles commands until `Stop`. A fatal error ends the loop early and
    /// is returned after it has been reported to the controller.
    pub fn run(mut self) -> Result<WorkerSummary, Error> {
        let span = debug_span!("worker", rank = self.rank());
        let _guard = span.enter();
        debug!("waiting for commands");

        while self.handle_next()? == Step::Continue {}

        if !self.objects.is_empty() {
            debug!("{} objects still alive at stop: {:?}", self.objects.len(), self.objects.ids());
        }
        Ok(WorkerSummary {
            rank: self.rank(),
            commands: self.handled,
            objects_left: self.objects.len(),
        })
    }

    /// Receives and applies exactly one command.
    pub fn handle_next(&mut self) -> Result<Step, Error> {
        let frame = self.transport.receive_broadcast()?;
        let command = Command::decode(&frame).map_err(|e| {
            error!("dropping out of the dispatch loop: {}", e);
            e
        })?;
        self.handled += 1;
        trace!("received {:?}", command);

        if command == Command::Stop {
            info!("stopped after {} commands", self.handled);
            return Ok(Step::Stop);
        }

        let expects_reply = command.expects_reply(self.config.status_channel);
        let (outcome, payload) = match self.apply(command) {
            Ok(payload) => (Ok(()), payload),
            Err(failure) => (Err(failure), Vec::new()),
        };

        if expects_reply {
            let reply = Reply {
                status: StatusReport::from(&outcome),
                payload,
            };
            self.transport.gather_send(reply.to_payload()?)?;
        }

        match outcome {
            Ok(()) => Ok(Step::Continue),
            Err(Failure::User(message)) => {
                warn!("user error: {}", message);
                Ok(Step::Continue)
            }
            Err(fatal) => {
                let e = Error::from_failure(self.rank(), fatal);
                error!("{}", e);
                Err(e)
            }
        }
    }

    /// Applies a command's effect and returns the reply payload, which is
    /// empty except for `InvokeGather` and `Dump`.
    fn apply(&mut self, command: Command) -> Result<Vec<u8>, Failure> {
        match command {
            Command::AssociateClass { name, id } => {
                self.associations
                    .associate_class(&self.registry, &name, id)?;
                info!("associated class \"{}\" to class id {}", name, id);
                Ok(Vec::new())
            }
            Command::AssociateMethod { name, id } => {
                self.associations
                    .associate_method(&self.registry, &name, id)?;
                info!("associated method \"{}\" to method id {}", name, id);
                Ok(Vec::new())
            }
            Command::Create {
                class_id,
                object_id,
            } => {
                let class = self.class_name(class_id)?;
                let instance = self
                    .registry
                    .construct(class)
                    .ok_or_else(|| Failure::NotRegistered(class.to_owned()))?;
                self.objects.insert(object_id, class_id, instance)?;
                debug!("created object {} of class \"{}\"", object_id, class);
                Ok(Vec::new())
            }
            Command::Invoke {
                class_id,
                method_id,
                object_id,
                argument,
            } => {
                self.invoke(class_id, method_id, object_id, &argument, false)?;
                Ok(Vec::new())
            }
            Command::InvokeGather {
                class_id,
                method_id,
                object_id,
            } => self
                .invoke(class_id, method_id, object_id, &[], true)
                .map(Option::unwrap_or_default),
            Command::Destroy {
                class_id,
                object_id,
            } => {
                self.objects.remove(object_id, class_id)?;
                debug!("destroyed object {} of class id {}", object_id, class_id);
                Ok(Vec::new())
            }
            Command::Dump => {
                let ids = self.objects.ids();
                info!("{} live objects: {:?}", ids.len(), ids);
                ids.to_payload()
                    .map_err(|e| Failure::Internal(format!("object table: {e}")))
            }
            Command::Stop => Ok(Vec::new()),
        }
    }

    fn invoke(
        &mut self,
        class_id: ClassId,
        method_id: MethodId,
        object_id: ObjectId,
        argument: &[u8],
        gather: bool,
    ) -> Result<Option<Vec<u8>>, Failure> {
        let class = self.class_name(class_id)?;
        let name = self.associations.method_name(method_id).ok_or_else(|| {
            Failure::Internal(format!("does not have a caller for method id {method_id}"))
        })?;
        let invocable = self
            .registry
            .method(name)
            .ok_or_else(|| Failure::NotRegistered(name.to_owned()))?;
        if invocable.class_name() != class {
            return Err(Failure::Internal(format!(
                "method \"{name}\" belongs to class \"{}\", not \"{class}\"",
                invocable.class_name()
            )));
        }
        if gather && !invocable.gathers() {
            return Err(Failure::Internal(format!(
                "method \"{name}\" was not registered as a gathering method"
            )));
        }

        let object = self.objects.get_mut(object_id, class_id)?;
        trace!("invoking \"{}\" on object {}", name, object_id);
        invocable.invoke(object.as_mut(), argument)
    }

    fn class_name(&self, class_id: ClassId) -> Result<&'static str, Failure> {
        self.associations.class_name(class_id).ok_or_else(|| {
            Failure::Internal(format!("does not have a factory for class id {class_id}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Probe;

    #[test]
    fn object_ids_are_never_reused() {
        let mut table = ObjectTable::new();
        table.insert(0, 0, Box::new(Probe)).unwrap();
        table.insert(2, 0, Box::new(Probe)).unwrap();
        assert!(matches!(
            table.insert(2, 0, Box::new(Probe)),
            Err(Failure::Internal(_))
        ));
        table.remove(0, 0).unwrap();
        assert!(matches!(
            table.insert(0, 0, Box::new(Probe)),
            Err(Failure::Internal(_))
        ));
        assert_eq!(table.ids(), vec![2]);
    }

    #[test]
    fn lookups_check_the_class() {
        let mut table = ObjectTable::new();
        table.insert(5, 1, Box::new(Probe)).unwrap();
        assert!(matches!(table.get_mut(5, 0), Err(Failure::Internal(_))));
        assert!(matches!(table.remove(4, 1), Err(Failure::Internal(_))));
        let object = table.get_mut(5, 1).unwrap();
        assert_eq!(object.downcast_ref::<Probe>(), Some(&Probe));
        table.remove(5, 1).unwrap();
        assert!(table.is_empty());
    }
}
