//! App-name and user-id resolution for incoming runs.
//!
//! Each resolves with a fixed precedence: a static value, then a
//! caller-supplied extractor, then the default (the agent's name for the
//! app, a per-thread synthetic id for the user).  Configuring both a
//! static value and an extractor is rejected up front.

use std::sync::Arc;

use swb_domain::wire::RunInput;
use swb_domain::{Error, Result};

/// Extracts an identity value from a run request.
pub type Extractor = Arc<dyn Fn(&RunInput) -> String + Send + Sync>;

enum Source {
    Static(String),
    Extract(Extractor),
    Default,
}

pub struct IdentityResolver {
    app: Source,
    user: Source,
    agent_name: String,
}

impl IdentityResolver {
    pub fn new(
        app_name: Option<String>,
        app_name_extractor: Option<Extractor>,
        user_id: Option<String>,
        user_id_extractor: Option<Extractor>,
        agent_name: impl Into<String>,
    ) -> Result<Self> {
        let app = match (app_name, app_name_extractor) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "cannot specify both app_name and app_name_extractor".into(),
                ));
            }
            (Some(name), None) => Source::Static(name),
            (None, Some(extract)) => Source::Extract(extract),
            (None, None) => Source::Default,
        };
        let user = match (user_id, user_id_extractor) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(
                    "cannot specify both user_id and user_id_extractor".into(),
                ));
            }
            (Some(id), None) => Source::Static(id),
            (None, Some(extract)) => Source::Extract(extract),
            (None, None) => Source::Default,
        };
        Ok(Self {
            app,
            user,
            agent_name: agent_name.into(),
        })
    }

    pub fn app_name(&self, input: &RunInput) -> String {
        match &self.app {
            Source::Static(name) => name.clone(),
            Source::Extract(extract) => extract(input),
            Source::Default => self.agent_name.clone(),
        }
    }

    pub fn user_id(&self, input: &RunInput) -> String {
        match &self.user {
            Source::Static(id) => id.clone(),
            Source::Extract(extract) => extract(input),
            Source::Default => format!("thread_user_{}", input.thread_id),
        }
    }
}
