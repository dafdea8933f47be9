#![allow(dead_code)]

use async_trait::async_trait;
use foreman_agent::{
    FixedScorer, Planner, PlannerError, PlannerRequest, ScriptedPlanner, SessionServices,
    TaskLedger, ToolRegistry,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn action(name: &str, args: Value) -> String {
    json!({ "action": name, "args": args }).to_string()
}

pub fn done(result: &str) -> String {
    json!({ "action": "DONE", "result": result }).to_string()
}

pub fn scripted<I>(replies: I) -> Arc<ScriptedPlanner>
where
    I: IntoIterator<Item = String>,
{
    Arc::new(ScriptedPlanner::new(replies))
}

pub fn services(planner: Arc<dyn Planner>) -> SessionServices {
    SessionServices::new(
        planner,
        Arc::new(ToolRegistry::with_builtin_tools()),
        Arc::new(TaskLedger::new()),
    )
}

/// Services whose gate always accepts.
pub fn permissive_services(planner: Arc<dyn Planner>) -> SessionServices {
    services(planner).with_scorer(Arc::new(FixedScorer::new(100, Vec::new())))
}

/// Picks a script by a marker found in the session goal, so concurrent
/// specialists sharing one planner each follow their own plan.
#[derive(Default)]
pub struct RoutingPlanner {
    routes: Mutex<HashMap<String, Vec<String>>>,
    stalls: Vec<String>,
}

impl RoutingPlanner {
    pub fn route<I>(self, marker: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        // Stored back to front so `Vec::pop` replays in order.
        let mut replies: Vec<String> = replies.into_iter().collect();
        replies.reverse();
        self.routes
            .lock()
            .expect("routes lock")
            .insert(marker.to_string(), replies);
        self
    }

    /// Sessions whose goal contains `marker` never get a reply.
    pub fn stall(mut self, marker: &str) -> Self {
        self.stalls.push(marker.to_string());
        self
    }
}

#[async_trait]
impl Planner for RoutingPlanner {
    async fn plan(&self, request: &PlannerRequest) -> Result<String, PlannerError> {
        if self.stalls.iter().any(|marker| request.goal.contains(marker)) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let mut routes = self.routes.lock().expect("routes lock");
        let script = routes
            .iter_mut()
            .find(|(marker, _)| request.goal.contains(marker.as_str()))
            .map(|(_, script)| script);
        match script.and_then(Vec::pop) {
            Some(reply) => Ok(reply),
            None => Ok(done("nothing left to do")),
        }
    }
}
