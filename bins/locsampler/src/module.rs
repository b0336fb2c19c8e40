use loc_core::store::DefaultKv;
use tokio::task::JoinHandle;

use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct ModuleCtx {
    pub scheduler: Scheduler<DefaultKv>,
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

pub trait Module: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, ctx: ModuleCtx) -> JoinHandle<anyhow::Result<()>>;
}
