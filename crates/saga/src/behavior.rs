//! Behavior chains: the activities of one matched transition, linked in order.

use std::sync::Arc;

use pipeline::Message;

use crate::activity::{Activity, BehaviorContext, FaultOutcome};
use crate::error::ActivityError;
use crate::instance::SagaInstance;

struct BehaviorLink<S, M> {
    activity: Arc<dyn Activity<S, M>>,
    next: Option<usize>,
}

/// A fault that escaped every hook, tagged with the activity that raised it.
#[derive(Debug)]
pub(crate) struct ChainFault {
    pub(crate) activity: String,
    pub(crate) error: ActivityError,
}

/// Activities built for a single dispatch.
///
/// Links live in one arena and point at their successor by index; `None` is
/// the end of the chain. The chain is walked forward and unwound backwards
/// without recursion.
pub(crate) struct BehaviorChain<S, M> {
    links: Vec<BehaviorLink<S, M>>,
    head: Option<usize>,
}

impl<S: SagaInstance, M: Message> BehaviorChain<S, M> {
    pub(crate) fn build(activities: impl IntoIterator<Item = Arc<dyn Activity<S, M>>>) -> Self {
        let mut links: Vec<BehaviorLink<S, M>> = activities
            .into_iter()
            .map(|activity| BehaviorLink {
                activity,
                next: None,
            })
            .collect();

        let count = links.len();
        for (index, link) in links.iter_mut().enumerate() {
            link.next = (index + 1 < count).then_some(index + 1);
        }

        Self {
            head: (count > 0).then_some(0),
            links,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    /// Runs every link in order. On a fault, hooks run from the raising link
    /// back to the head; activities after the raising link never run.
    pub(crate) async fn execute(
        &self,
        context: &mut BehaviorContext<'_, S, M>,
    ) -> Result<(), ChainFault> {
        let mut visited = Vec::with_capacity(self.links.len());
        let mut cursor = self.head;

        while let Some(index) = cursor {
            let link = &self.links[index];
            visited.push(index);

            if let Err(error) = link.activity.execute(context).await {
                tracing::debug!(activity = link.activity.name(), %error, "activity faulted");
                let raised_by = link.activity.name().to_string();
                return self.unwind(context, visited, raised_by, error).await;
            }
            cursor = link.next;
        }

        Ok(())
    }

    async fn unwind(
        &self,
        context: &mut BehaviorContext<'_, S, M>,
        visited: Vec<usize>,
        raised_by: String,
        mut error: ActivityError,
    ) -> Result<(), ChainFault> {
        for index in visited.into_iter().rev() {
            let activity = &self.links[index].activity;
            match activity.faulted(context, error).await {
                FaultOutcome::Propagate(next) => error = next,
                FaultOutcome::Suppress => {
                    tracing::info!(
                        activity = activity.name(),
                        raised_by = %raised_by,
                        "fault suppressed by hook"
                    );
                    return Ok(());
                }
            }
        }

        Err(ChainFault {
            activity: raised_by,
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pipeline::ConsumeContext;
    use saga_store::CorrelationId;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::instance::State;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Counter {
        correlation_id: CorrelationId,
        current_state: String,
        value: u32,
    }

    impl SagaInstance for Counter {
        fn with_correlation_id(correlation_id: CorrelationId) -> Self {
            Self {
                correlation_id,
                current_state: State::INITIAL.to_string(),
                value: 0,
            }
        }
        fn correlation_id(&self) -> CorrelationId {
            self.correlation_id
        }
        fn current_state(&self) -> &str {
            &self.current_state
        }
        fn set_current_state(&mut self, state: &State) {
            self.current_state = state.to_string();
        }
    }

    #[derive(Debug)]
    struct Tick;
    impl Message for Tick {}

    type Log = Arc<Mutex<Vec<String>>>;

    enum Hook {
        Propagate,
        Suppress,
        Replace(&'static str),
    }

    struct Step {
        name: &'static str,
        fail: bool,
        hook: Hook,
        log: Log,
    }

    impl Step {
        fn ok(name: &'static str, log: &Log) -> Arc<dyn Activity<Counter, Tick>> {
            Self::with(name, false, Hook::Propagate, log)
        }

        fn with(
            name: &'static str,
            fail: bool,
            hook: Hook,
            log: &Log,
        ) -> Arc<dyn Activity<Counter, Tick>> {
            Arc::new(Step {
                name,
                fail,
                hook,
                log: Arc::clone(log),
            })
        }
    }

    #[async_trait]
    impl Activity<Counter, Tick> for Step {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(
            &self,
            context: &mut BehaviorContext<'_, Counter, Tick>,
        ) -> Result<(), ActivityError> {
            self.log.lock().unwrap().push(format!("execute:{}", self.name));
            context.instance_mut().value += 1;
            if self.fail {
                return Err(ActivityError::new(format!("{} failed", self.name)));
            }
            Ok(())
        }

        async fn faulted(
            &self,
            _context: &mut BehaviorContext<'_, Counter, Tick>,
            error: ActivityError,
        ) -> FaultOutcome {
            self.log.lock().unwrap().push(format!("faulted:{}", self.name));
            match self.hook {
                Hook::Propagate => FaultOutcome::Propagate(error),
                Hook::Suppress => FaultOutcome::Suppress,
                Hook::Replace(message) => FaultOutcome::Propagate(ActivityError::new(message)),
            }
        }
    }

    async fn run(chain: &BehaviorChain<Counter, Tick>) -> (Counter, Result<(), ChainFault>) {
        let mut instance = Counter::with_correlation_id(CorrelationId::new());
        let consume = ConsumeContext::new(Tick);
        let result = {
            let mut context = BehaviorContext::new(&mut instance, &consume, "Tick");
            chain.execute(&mut context).await
        };
        (instance, result)
    }

    #[tokio::test]
    async fn links_run_in_order() {
        let log = Log::default();
        let chain = BehaviorChain::build([
            Step::ok("a", &log),
            Step::ok("b", &log),
            Step::ok("c", &log),
        ]);

        let (instance, result) = run(&chain).await;

        assert!(result.is_ok());
        assert_eq!(chain.len(), 3);
        assert_eq!(instance.value, 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["execute:a", "execute:b", "execute:c"]
        );
    }

    #[tokio::test]
    async fn empty_chain_is_a_no_op() {
        let chain = BehaviorChain::<Counter, Tick>::build(Vec::new());
        let (instance, result) = run(&chain).await;
        assert!(result.is_ok());
        assert_eq!(instance.value, 0);
    }

    #[tokio::test]
    async fn fault_skips_downstream_and_unwinds_in_reverse() {
        let log = Log::default();
        let chain = BehaviorChain::build([
            Step::ok("a", &log),
            Step::ok("b", &log),
            Step::with("c", true, Hook::Propagate, &log),
            Step::ok("d", &log),
        ]);

        let (_, result) = run(&chain).await;

        let fault = result.unwrap_err();
        assert_eq!(fault.activity, "c");
        assert_eq!(fault.error.message(), "c failed");
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "execute:a",
                "execute:b",
                "execute:c",
                "faulted:c",
                "faulted:b",
                "faulted:a"
            ]
        );
    }

    #[tokio::test]
    async fn suppressing_hook_stops_the_unwind() {
        let log = Log::default();
        let chain = BehaviorChain::build([
            Step::ok("a", &log),
            Step::with("b", false, Hook::Suppress, &log),
            Step::with("c", true, Hook::Propagate, &log),
            Step::ok("d", &log),
        ]);

        let (instance, result) = run(&chain).await;

        assert!(result.is_ok());
        assert_eq!(instance.value, 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "execute:a",
                "execute:b",
                "execute:c",
                "faulted:c",
                "faulted:b"
            ]
        );
    }

    #[tokio::test]
    async fn hooks_can_replace_the_error() {
        let log = Log::default();
        let chain = BehaviorChain::build([
            Step::with("compensate", false, Hook::Replace("compensated"), &log),
            Step::with("charge", true, Hook::Propagate, &log),
        ]);

        let (_, result) = run(&chain).await;

        let fault = result.unwrap_err();
        assert_eq!(fault.activity, "charge");
        assert_eq!(fault.error.message(), "compensated");
    }
}
