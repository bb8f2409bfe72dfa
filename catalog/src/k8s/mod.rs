use kube::Resource;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

pub mod backoff;
pub mod cache;
pub mod connector;
pub mod handlers;
pub mod source;
pub mod watcher;

pub trait Object: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static {}

impl<T> Object for T where T: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static {}
