use crate::controller::LoopView;
use crate::engine::EngineHandle;
use crate::enrollment::{EnrollError, EnrollmentStore};
use zbus::interface;

pub const BUS_NAME: &str = "org.facewatch.Facewatch1";
pub const OBJECT_PATH: &str = "/org/facewatch/Facewatch1";

/// D-Bus interface for the facewatch daemon.
///
/// Bus name: org.facewatch.Facewatch1
/// Object path: /org/facewatch/Facewatch1
pub struct FacewatchService {
    store: EnrollmentStore,
    view: LoopView,
    engine: Option<EngineHandle>,
}

impl FacewatchService {
    pub fn new(store: EnrollmentStore, view: LoopView, engine: Option<EngineHandle>) -> Self {
        Self { store, view, engine }
    }
}

#[interface(name = "org.facewatch.Facewatch1")]
impl FacewatchService {
    /// Replace the enrolled identity with the most prominent face in `image`
    /// (PNG, JPEG, BMP...). Returns the new enrollment as JSON.
    async fn enroll(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "enroll requested");
        match self.store.enroll(self.engine.as_ref(), image).await {
            Ok(identity) => Ok(serde_json::json!({
                "label": identity.label,
                "enrolled_at": identity.enrolled_at,
                "message": "Image processed and face descriptor stored.",
            })
            .to_string()),
            Err(e @ EnrollError::Decode(_)) => Err(zbus::fdo::Error::InvalidArgs(e.to_string())),
            Err(e) => Err(zbus::fdo::Error::Failed(e.to_string())),
        }
    }

    /// Loop state, enrollment, match flag and stabilized attributes as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(status_json(&self.view, &self.store).to_string())
    }

    /// The most recent overlay display list as JSON.
    async fn overlay(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&*self.view.overlay())
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

fn status_json(view: &LoopView, store: &EnrollmentStore) -> serde_json::Value {
    let enrolled = store.current().map(|identity| {
        serde_json::json!({
            "label": identity.label,
            "enrolled_at": identity.enrolled_at,
        })
    });
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "state": view.state(),
        "enrolled": enrolled,
        "match_found": view.match_found(),
        "attributes": view.attributes(),
        "error": view.last_error(),
    })
}
