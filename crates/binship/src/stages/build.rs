use std::fs;

use anyhow::{Context, Result};

use crate::build::{BuildMatrixExecutor, Compiler, expand};
use crate::context::RunContext;
use crate::stage::{Reporter, Stage};

pub struct BuildStage<'c> {
    compiler: &'c dyn Compiler,
}

impl<'c> BuildStage<'c> {
    pub fn new(compiler: &'c dyn Compiler) -> Self {
        Self { compiler }
    }
}

impl Stage for BuildStage<'_> {
    fn name(&self) -> &'static str {
        "build"
    }

    fn skip_reason(&self, ctx: &RunContext) -> Option<String> {
        expand(&ctx.config)
            .is_empty()
            .then(|| "every build is skipped".to_string())
    }

    fn run(&mut self, ctx: &RunContext, reporter: &mut dyn Reporter) -> Result<()> {
        fs::create_dir_all(&ctx.dist)
            .with_context(|| format!("failed to create {}", ctx.dist.display()))?;
        let built = BuildMatrixExecutor::new(self.compiler).build(ctx, reporter)?;
        reporter.info(&format!(
            "build: {} binaries with parallelism {}",
            built.len(),
            ctx.parallelism
        ));
        Ok(())
    }
}
