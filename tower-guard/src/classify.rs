use shot_guard::EntryRequest;
use shot_guard::EntryType;

/// Maps a request onto the engine entry that guards it.
///
/// Implemented for [`FixedResource`] and for any `Fn(&Req) -> EntryRequest`,
/// so a closure can pick the resource, origin or hot parameters per request.
pub trait Classify<Req> {
    fn classify(&self, req: &Req) -> EntryRequest;
}

/// Guards every request as one inbound resource.
#[derive(Debug, Clone)]
pub struct FixedResource {
    resource: String,
}

impl FixedResource {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
        }
    }
}

impl<Req> Classify<Req> for FixedResource {
    fn classify(&self, _req: &Req) -> EntryRequest {
        EntryRequest::new(self.resource.clone()).with_entry_type(EntryType::In)
    }
}

impl<Req, F> Classify<Req> for F
where
    F: Fn(&Req) -> EntryRequest,
{
    fn classify(&self, req: &Req) -> EntryRequest {
        self(req)
    }
}
