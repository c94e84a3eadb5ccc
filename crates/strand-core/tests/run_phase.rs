//! `run_phase` 端到端场景：跨线程请求的顺序与线程归属、故障透传、阶段中途取消。

use std::{
    sync::Arc,
    thread::{self, ThreadId},
    time::Duration,
};

use futures::channel::oneshot;
use parking_lot::Mutex;
use proptest::prelude::*;
use strand_core::{
    AdapterError, AdapterOptions, CancellationToken, CmdletId, Completion,
    ExecutionAdapterContext, OperationScope, QueueingExecutionContext,
};

fn context() -> Arc<ExecutionAdapterContext> {
    ExecutionAdapterContext::new(
        CmdletId::next(),
        AdapterOptions::default().with_label("run-phase-test"),
        CancellationToken::none(),
    )
}

type Trace = Arc<Mutex<Vec<(usize, ThreadId)>>>;

/// 在 `threads` 条外部线程上按全局序号依次发起 `count` 个请求，返回全部完成句柄。
///
/// 序号在同一把锁内分配并入队，因此“发起顺序”即序号顺序。
fn issue_from_threads(
    ctx: &Arc<ExecutionAdapterContext>,
    trace: &Trace,
    count: usize,
    threads: usize,
) -> Vec<Completion<()>> {
    let issue_lock = Arc::new(Mutex::new(0_usize));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let ctx = Arc::clone(ctx);
            let trace = Arc::clone(trace);
            let issue_lock = Arc::clone(&issue_lock);
            thread::spawn(move || {
                let mut completions = Vec::new();
                loop {
                    let mut next = issue_lock.lock();
                    if *next >= count {
                        break completions;
                    }
                    let seq = *next;
                    *next += 1;
                    let trace = Arc::clone(&trace);
                    let completion = ctx
                        .request_operation(
                            move || {
                                trace.lock().push((seq, thread::current().id()));
                                Ok(())
                            },
                            false,
                            None,
                        )
                        .expect("阶段进行中应可请求");
                    drop(next);
                    completions.push(completion);
                }
            })
        })
        .collect();
    handles
        .into_iter()
        .flat_map(|handle| handle.join().expect("请求线程不应 panic"))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// 任意线程发起的 N 个请求全部在拥有线程上、按发起顺序执行。
    #[test]
    fn requests_from_any_thread_run_on_owner_in_issue_order(count in 1_usize..40, threads in 1_usize..5) {
        let ctx = context();
        let trace: Trace = Arc::new(Mutex::new(Vec::new()));
        let owner = thread::current().id();

        let body_ctx = Arc::clone(&ctx);
        let body_trace = Arc::clone(&trace);
        ctx.run_phase(async move {
            let (tx, rx) = oneshot::channel();
            thread::spawn(move || {
                let _ = tx.send(issue_from_threads(&body_ctx, &body_trace, count, threads));
            });
            let completions = rx.await.map_err(|_| AdapterError::Cancelled)?;
            for completion in completions {
                completion.await?;
            }
            Ok(())
        })
        .expect("阶段应成功");

        let trace = trace.lock();
        prop_assert_eq!(trace.len(), count);
        prop_assert!(trace.iter().all(|(_, thread)| *thread == owner));
        let order: Vec<_> = trace.iter().map(|(seq, _)| *seq).collect();
        prop_assert_eq!(order, (0..count).collect::<Vec<_>>());
    }
}

#[derive(Debug, thiserror::Error)]
#[error("widget inventory unavailable: {0}")]
struct InventoryError(&'static str);

/// 主体故障原样返回，且返回时队列已关闭、作用域已释放。
#[test]
fn body_fault_surfaces_unchanged_after_the_pump_ends() {
    let ctx = context();
    let captured: Arc<Mutex<Option<Arc<OperationScope>>>> = Arc::new(Mutex::new(None));

    let body_ctx = Arc::clone(&ctx);
    let slot = Arc::clone(&captured);
    let err = ctx
        .run_phase(async move {
            *slot.lock() = body_ctx.current_scope()?;
            body_ctx.request_operation(|| Ok(()), false, None)?.await?;
            Err(AdapterError::fault(InventoryError("eu-west")))
        })
        .expect_err("主体故障应返回");

    let fault = err.as_fault().expect("应为用户故障");
    assert_eq!(
        fault.downcast_ref::<InventoryError>().map(|e| e.0),
        Some("eu-west")
    );
    assert_eq!(err.to_string(), "widget inventory unavailable: eu-west");

    let scope = captured.lock().take().expect("主体应记录作用域");
    assert!(scope.is_closed(), "返回时队列必定已关闭");
    assert!(scope.is_disposed());
    assert!(ctx.current_scope().expect("上下文未释放").is_none());
}

/// 排队动作失败只投递给其完成句柄，主体可以选择处理而不让阶段失败。
#[test]
fn queued_action_fault_is_delivered_through_its_completion() {
    let ctx = context();
    let body_ctx = Arc::clone(&ctx);
    ctx.run_phase(async move {
        let err = body_ctx
            .request_operation(|| Err(AdapterError::fault("pipeline stopped")), false, None)?
            .await
            .expect_err("动作失败应投递给句柄");
        assert_eq!(err.to_string(), "pipeline stopped");
        Ok(())
    })
    .expect("主体处理了失败，阶段应成功");
}

/// 阶段中途取消：主体的取消检查返回取消，`run_phase` 正常返回，作用域只释放一次。
#[test]
fn cancel_mid_phase_returns_normally_and_disposes_once() {
    let ctx = context();
    let captured: Arc<Mutex<Option<Arc<OperationScope>>>> = Arc::new(Mutex::new(None));

    let stopper = {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || {
            while ctx.current_scope().ok().flatten().is_none() {
                thread::yield_now();
            }
            thread::sleep(Duration::from_millis(10));
            ctx.cancel();
        })
    };

    let body_ctx = Arc::clone(&ctx);
    let slot = Arc::clone(&captured);
    ctx.run_phase(async move {
        *slot.lock() = body_ctx.current_scope()?;
        let token = body_ctx.cancellation_token()?;
        token.cancelled().await;
        token.check()
    })
    .expect("取消不应作为故障交给宿主");
    stopper.join().expect("取消线程不应 panic");

    let scope = captured.lock().take().expect("主体应记录作用域");
    assert!(scope.is_disposed());
    assert!(
        scope.dispose().unwrap_err().is_disposed(),
        "作用域已被阶段释放过一次"
    );
    ctx.cancel();
}

/// 主体因取消结束时，取消前已排队的请求照常执行；取消后才入队的请求被放弃。
#[test]
fn work_queued_before_cancel_still_runs_when_the_phase_stops() {
    let ctx = context();
    let log = Arc::new(Mutex::new(Vec::new()));
    let late: Arc<Mutex<Option<Completion<()>>>> = Arc::new(Mutex::new(None));
    let captured: Arc<Mutex<Option<Arc<OperationScope>>>> = Arc::new(Mutex::new(None));

    let body_ctx = Arc::clone(&ctx);
    let body_log = Arc::clone(&log);
    let late_slot = Arc::clone(&late);
    let scope_slot = Arc::clone(&captured);
    ctx.run_phase(async move {
        *scope_slot.lock() = body_ctx.current_scope()?;
        let ambient = QueueingExecutionContext::current().expect("拥有线程上应登记环境上下文");

        let posted = Arc::clone(&body_log);
        ambient.post(move || posted.lock().push("posted"))?;
        let requested = Arc::clone(&body_log);
        let _requested = body_ctx.request_operation(
            move || {
                requested.lock().push("requested");
                Ok(())
            },
            false,
            None,
        )?;

        body_ctx.cancel();
        let after = Arc::clone(&body_log);
        *late_slot.lock() = Some(body_ctx.request_operation(
            move || {
                after.lock().push("after cancel");
                Ok(())
            },
            false,
            None,
        )?);
        body_ctx.cancellation_token()?.check()
    })
    .expect("取消不应作为故障交给宿主");

    assert_eq!(*log.lock(), vec!["posted", "requested"]);
    let late = late.lock().take().expect("取消后的请求已入队");
    assert!(late.wait().unwrap_err().is_cancelled());
    let scope = captured.lock().take().expect("主体应记录作用域");
    assert_eq!(scope.stats().delivered, 2);
    assert_eq!(scope.stats().dropped, 1);
}

/// 投递回调的故障没有等待方，主体成功时作为阶段结局返回。
#[test]
fn posted_callback_fault_is_not_lost() {
    let ctx = context();
    let body_ctx = Arc::clone(&ctx);
    let err = ctx
        .run_phase(async move {
            let ambient = QueueingExecutionContext::current().expect("拥有线程上应登记环境上下文");
            ambient.post(|| panic!("posted callback exploded"))?;
            body_ctx.request_operation(|| Ok(()), false, None)?.await
        })
        .expect_err("投递回调的故障应返回宿主");
    assert!(err.to_string().contains("posted callback exploded"));
}

/// 外层令牌取消会传播到阶段作用域。
#[test]
fn parent_token_cancels_running_phase() {
    let parent = strand_core::CancellationSource::new();
    let ctx = ExecutionAdapterContext::new(CmdletId::next(), AdapterOptions::default(), parent.token());

    let body_ctx = Arc::clone(&ctx);
    ctx.run_phase(async move {
        let token = body_ctx.cancellation_token()?;
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            parent.cancel();
        });
        token.cancelled().await;
        token.check()
    })
    .expect("外层取消同样被吞掉");
}

/// 主体在 tokio 工作线程上完成计算，结果写回仍发生在拥有线程。
#[test]
fn tokio_workers_compute_while_owner_writes() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_time()
        .build()
        .expect("构建 tokio 运行时");
    let ctx = context();
    let owner = thread::current().id();
    let writes: Arc<Mutex<Vec<(u32, ThreadId)>>> = Arc::new(Mutex::new(Vec::new()));

    let body_ctx = Arc::clone(&ctx);
    let sink = Arc::clone(&writes);
    let handle = runtime.handle().clone();
    ctx.run_phase(async move {
        for round in 0..3_u32 {
            let value = handle
                .spawn(async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    round * 10
                })
                .await
                .map_err(AdapterError::fault)?;
            let sink = Arc::clone(&sink);
            body_ctx
                .request_operation(
                    move || {
                        sink.lock().push((value, thread::current().id()));
                        Ok(())
                    },
                    false,
                    None,
                )?
                .await?;
        }
        Ok(())
    })
    .expect("阶段应成功");

    let writes = writes.lock();
    assert_eq!(
        writes.iter().map(|(v, _)| *v).collect::<Vec<_>>(),
        vec![0, 10, 20]
    );
    assert!(writes.iter().all(|(_, thread)| *thread == owner));
}
