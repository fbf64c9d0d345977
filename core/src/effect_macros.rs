//! Declarative macro for building fire-and-forget effects.

/// Create an `Effect::Future` from an async block
///
/// # Example
///
/// ```rust,ignore
/// use slotwise_core::async_effect;
///
/// async_effect! {
///     hook.increment(key, SessionCounter::CompletedSessions).await.ok();
///     None
/// }
/// ```
#[macro_export]
macro_rules! async_effect {
    ($($body:tt)*) => {
        $crate::effect::Effect::Future(
            ::std::boxed::Box::pin(async move { $($body)* })
        )
    };
}

#[cfg(test)]
mod tests {
    use crate::effect::Effect;

    #[derive(Clone, Debug)]
    enum TestAction {
        Recorded { value: i32 },
    }

    #[test]
    fn test_async_effect_macro() {
        let effect = async_effect! {
            Some(TestAction::Recorded { value: 42 })
        };

        assert!(matches!(effect, Effect::Future(_)));
    }

    #[tokio::test]
    async fn test_async_effect_produces_action() {
        let effect = async_effect! {
            Some(TestAction::Recorded { value: 7 })
        };

        let Effect::Future(fut) = effect else {
            unreachable!("async_effect! always builds Effect::Future");
        };
        let action = fut.await;
        assert!(matches!(action, Some(TestAction::Recorded { value: 7 })));
    }
}
