pub mod registry;
pub mod remote_object;

pub use registry::{InMemoryRegistry, ObjectRegistry};
pub use remote_object::{CloudConnection, NoCloud, ObjComm, RemoteObject, RemoteObjectListener};
