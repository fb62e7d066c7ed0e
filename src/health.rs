use crate::graph::GraphRepo;
use crate::transport::envelope::Response;

/// Liveness probe backing `GET /health`: returns 200 when the graph store
/// answers a trivial query, 503 otherwise.
pub async fn check(repo: &dyn GraphRepo) -> Response {
    match repo.ping().await {
        Ok(()) => Response::text(200, "OK"),
        Err(e) => Response::text(503, format!("graph store unavailable: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PropolisError;
    use crate::model::{Command, ExecResult};
    use async_trait::async_trait;

    struct FakeRepo {
        healthy: bool,
    }

    #[async_trait]
    impl GraphRepo for FakeRepo {
        async fn execute(&self, _command: Command) -> Result<ExecResult, PropolisError> {
            Ok(ExecResult::Empty)
        }

        async fn ping(&self) -> anyhow::Result<()> {
            if self.healthy {
                Ok(())
            } else {
                Err(anyhow::anyhow!("down"))
            }
        }
    }

    #[tokio::test]
    async fn reports_ok_when_store_is_reachable() {
        let resp = check(&FakeRepo { healthy: true }).await;
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn reports_unavailable_when_store_is_down() {
        let resp = check(&FakeRepo { healthy: false }).await;
        assert_eq!(resp.status, 503);
    }
}
