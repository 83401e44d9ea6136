use crate::{
    backend::{Backend, RequestId},
    error::BackendError,
};

/// An outstanding nonblocking backend request.
///
/// The guard must be completed through [`wait_all`]; dropping a request
/// that was never waited on is a bug and trips a debug assertion.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    id: RequestId,
    waited: bool,
}

impl PendingRequest {
    pub fn new(id: RequestId) -> Self {
        Self { id, waited: false }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    fn complete(mut self) -> RequestId {
        self.waited = true;
        self.id
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        debug_assert!(
            self.waited || std::thread::panicking(),
            "request {:?} dropped without wait",
            self.id
        );
    }
}

/// Waits on every request of the given lists and empties them.
///
/// The lists are emptied even if the backend reports a failure.
pub(crate) fn wait_all<'a>(
    backend: &mut dyn Backend,
    lists: impl IntoIterator<Item = &'a mut Vec<PendingRequest>>,
) -> Result<(), BackendError> {
    let ids: Vec<RequestId> = lists
        .into_iter()
        .flat_map(|list| list.drain(..))
        .map(PendingRequest::complete)
        .collect();
    if ids.is_empty() {
        return Ok(());
    }
    tracing::trace!(requests = ids.len(), "wait on requests");
    backend.wait(&ids)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backend::Opener,
        descriptor::ElementType,
        memory::{DriverMode, MemoryNamespace, VarDef},
        region::Extent,
    };

    #[test]
    fn wait_all_drains_every_list() {
        let namespace = MemoryNamespace::new();
        let dataset = namespace.create("requests", DriverMode::Batched);
        let a = dataset.define_var(VarDef::new(ElementType::Byte, [2]));
        let b = dataset.define_var(VarDef::new(ElementType::Byte, [2]));
        let mut backend = namespace.open("requests", true, 0).unwrap();

        let extent = Extent {
            start: vec![0],
            count: vec![2],
        };
        let mut first = vec![PendingRequest::new(
            backend.put_regions_nb(a, &[extent.clone()], &[1, 2]).unwrap(),
        )];
        let mut second = vec![PendingRequest::new(
            backend.put_regions_nb(b, &[extent], &[3, 4]).unwrap(),
        )];
        assert_eq!(second[0].id(), RequestId(1));

        wait_all(backend.as_mut(), [&mut first, &mut second]).unwrap();
        assert!(first.is_empty() && second.is_empty());
        assert_eq!(dataset.read_all(a).unwrap(), vec![1, 2]);
        assert_eq!(dataset.read_all(b).unwrap(), vec![3, 4]);
        assert_eq!(backend.buffer_usage(), 0);
    }

    #[test]
    fn failed_wait_still_releases_requests() {
        let namespace = MemoryNamespace::new();
        namespace.create("requests", DriverMode::Batched);
        let mut backend = namespace.open("requests", true, 0).unwrap();

        let mut list = vec![PendingRequest::new(RequestId(42))];
        assert_eq!(
            wait_all(backend.as_mut(), [&mut list]),
            Err(BackendError::UnknownRequest(42))
        );
        assert!(list.is_empty());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "dropped without wait")]
    fn dropping_an_unwaited_request_panics() {
        drop(PendingRequest::new(RequestId(0)));
    }
}
