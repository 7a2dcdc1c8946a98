//! Kubernetes platform.
//!
//! Every agent is a single pod in the configured namespace. Pods carry the
//! `app=container-agent` label plus ownership labels so that reclamation can
//! find them again after a restart.

mod client;
mod models;

pub use client::KubernetesPods;
pub use models::{
    build_pod, build_registry_secret, owner_selector, pod_status, registry_secret_name,
    sanitize_label_value, AGENT_APP, LABEL_APP, LABEL_CLOUD, LABEL_INSTANCE, LABEL_TEMPLATE,
};
