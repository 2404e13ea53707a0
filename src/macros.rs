/// Builds an inline [`WorkItem`](crate::work::WorkItem) from an async block.
///
/// Takes an optional synchronous setup block and a mandatory async logic block.
/// The setup block runs on every execution, before the future is created; use it
/// to clone `Arc`s captured by the outer closure. The logic block must evaluate to
/// a [`WorkResult`](crate::work::WorkResult) and may use `?`.
///
/// # Usage
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use steward::{work_fn, TaskQueue};
///
/// let counter = Arc::new(AtomicUsize::new(0));
/// let queue = TaskQueue::new();
///
/// // With setup block:
/// queue.enqueue(work_fn! {
///   {
///     let counter = counter.clone();
///   }
///   {
///     counter.fetch_add(1, Ordering::SeqCst);
///     Ok(())
///   }
/// });
///
/// // Without setup block:
/// queue.enqueue(work_fn! {
///   {
///     let value: u32 = "42".parse()?;
///     assert_eq!(value, 42);
///     Ok(())
///   }
/// });
/// assert_eq!(queue.len(), 2);
/// ```
#[macro_export]
macro_rules! work_fn {
  // Setup block followed by the main logic block.
  (
    { $($setup_stmts:stmt);* $(;)? }
    $main_block:block
  ) => {
    $crate::work::WorkItem::from_boxed(Box::new(move || {
      $($setup_stmts;)*

      let fut = async move {
        let result: $crate::work::WorkResult = $main_block;
        result
      };

      Box::pin(fut) as $crate::work::WorkFuture
    }))
  };

  // Main logic block only.
  (
    $main_block:block
  ) => {
    $crate::work::WorkItem::from_boxed(Box::new(move || {
      let fut = async move {
        let result: $crate::work::WorkResult = $main_block;
        result
      };

      Box::pin(fut) as $crate::work::WorkFuture
    }))
  };
}
