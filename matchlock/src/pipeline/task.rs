//! Generic task trait for pipeline execution.

use async_trait::async_trait;
use matchlock_shared::MatchlockResult;

#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> MatchlockResult<()>;

    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
