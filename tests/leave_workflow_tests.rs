//! 休假工作流集成测试（内存存储）

use std::sync::Arc;
use std::time::Duration;

use leave_attendance::{
    calendar::HolidaySet,
    error::AppError,
    events::DomainEvent,
    models::leave::{
        LeaveRequestFilters, LeaveStatus, LeaveSummaryFilters, NegativeBalancePolicy, OverlapScope,
    },
    services::LeaveSettings,
};
use rust_decimal::Decimal;

mod common;
use common::{decision, half_day_input, leave_input, TestEnv, ANNUAL_LIMIT};

// 2025-01-06 是周一

#[tokio::test]
async fn test_approve_debits_working_days_and_emits_once() {
    let env = TestEnv::new().await;
    let mut events = env.state.events.subscribe();

    let request = env
        .state
        .leave
        .create(env.user_id, leave_input(env.policy_id, "2025-01-06", "2025-01-12"))
        .await
        .unwrap();
    assert_eq!(request.status, LeaveStatus::Pending);
    assert_eq!(request.user_email, "ada@example.com");

    let approved = env
        .state
        .leave
        .decide(request.request_id, env.admin_id, decision("APPROVE"))
        .await
        .unwrap();

    assert_eq!(approved.status, LeaveStatus::Approved);
    assert_eq!(approved.decided_by, Some(env.admin_id));
    assert_eq!(approved.days_deducted, Some(Decimal::from(5)));
    assert_eq!(env.balance_2025().await, Decimal::from(ANNUAL_LIMIT - 5));

    match events.try_recv().unwrap() {
        DomainEvent::LeaveApproved(event) => {
            assert_eq!(event.request_id, request.request_id);
            assert_eq!(event.email, "ada@example.com");
            assert_eq!(event.display_name.as_deref(), Some("Ada Lovelace"));
            assert_eq!(event.start_date, request.start_date);
            assert_eq!(event.end_date, request.end_date);
        }
    }

    // 重复批准：余额不变，不再发事件
    let again = env
        .state
        .leave
        .decide(request.request_id, env.admin_id, decision("approve"))
        .await
        .unwrap();
    assert_eq!(again.status, LeaveStatus::Approved);
    assert_eq!(env.balance_2025().await, Decimal::from(ANNUAL_LIMIT - 5));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_half_day_approval_debits_half() {
    let env = TestEnv::new().await;

    let request = env
        .state
        .leave
        .create(env.user_id, half_day_input(env.policy_id, "2025-01-08"))
        .await
        .unwrap();
    env.state
        .leave
        .decide(request.request_id, env.admin_id, decision("APPROVE"))
        .await
        .unwrap();

    assert_eq!(
        env.balance_2025().await,
        Decimal::from(ANNUAL_LIMIT) - Decimal::new(5, 1)
    );
}

#[tokio::test]
async fn test_holidays_are_not_debited() {
    let holidays: HolidaySet = ["2025-01-07", "2025-01-08"]
        .iter()
        .map(|d| d.parse().unwrap())
        .collect();
    let env = TestEnv::with_leave_settings(LeaveSettings {
        holidays: Arc::new(holidays),
        ..LeaveSettings::default()
    })
    .await;

    let request = env
        .state
        .leave
        .create(env.user_id, leave_input(env.policy_id, "2025-01-06", "2025-01-10"))
        .await
        .unwrap();
    env.state
        .leave
        .decide(request.request_id, env.admin_id, decision("APPROVE"))
        .await
        .unwrap();

    assert_eq!(env.balance_2025().await, Decimal::from(ANNUAL_LIMIT - 3));
}

#[tokio::test]
async fn test_overlapping_request_rejected() {
    let env = TestEnv::new().await;
    let leave = &env.state.leave;

    leave
        .create(env.user_id, leave_input(env.policy_id, "2025-02-03", "2025-02-07"))
        .await
        .unwrap();

    let err = leave
        .create(env.user_id, leave_input(env.policy_id, "2025-02-07", "2025-02-11"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Overlap { .. }));
    assert_eq!(err.code(), "LEAVE_OVERLAP");
    assert_eq!(err.status_code().as_u16(), 409);

    // 相邻但不相交
    leave
        .create(env.user_id, leave_input(env.policy_id, "2025-02-10", "2025-02-12"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_overlap_is_per_user() {
    let env = TestEnv::new().await;
    let other = env.store.add_user("bob@example.com", None).await;

    env.state
        .leave
        .create(env.user_id, leave_input(env.policy_id, "2025-02-03", "2025-02-07"))
        .await
        .unwrap();
    env.state
        .leave
        .create(other, leave_input(env.policy_id, "2025-02-03", "2025-02-07"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_rejected_request_frees_the_range() {
    let env = TestEnv::new().await;
    let leave = &env.state.leave;

    let first = leave
        .create(env.user_id, leave_input(env.policy_id, "2025-03-03", "2025-03-05"))
        .await
        .unwrap();
    leave
        .decide(first.request_id, env.admin_id, decision("REJECT"))
        .await
        .unwrap();

    let second = leave
        .create(env.user_id, leave_input(env.policy_id, "2025-03-03", "2025-03-05"))
        .await
        .unwrap();
    assert_eq!(second.status, LeaveStatus::Pending);
    assert_eq!(env.balance_2025().await, Decimal::from(ANNUAL_LIMIT));
}

#[tokio::test]
async fn test_create_validation_errors() {
    let env = TestEnv::new().await;
    let leave = &env.state.leave;

    let err = leave
        .create(env.user_id, leave_input(env.policy_id, "2025-01-10", "2025-01-06"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_DATE_RANGE");

    let err = leave
        .create(env.user_id, leave_input(env.policy_id, "not-a-date", "2025-01-06"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_DATE");

    let mut input = leave_input(env.policy_id, "2025-01-06", "2025-01-07");
    input.half_day = true;
    let err = leave.create(env.user_id, input).await.unwrap_err();
    assert_eq!(err.code(), "HALF_DAY_INVALID");

    // 只包含周末
    let err = leave
        .create(env.user_id, leave_input(env.policy_id, "2025-01-11", "2025-01-12"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "LEAVE_DURATION_INVALID");
}

#[tokio::test]
async fn test_unknown_or_inactive_policy_not_found() {
    let env = TestEnv::new().await;
    let retired = env
        .store
        .add_policy("Retired", Decimal::from(5), false)
        .await;

    let err = env
        .state
        .leave
        .create(env.user_id, leave_input(9999, "2025-01-06", "2025-01-06"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = env
        .state
        .leave
        .create(env.user_id, leave_input(retired, "2025-01-06", "2025-01-06"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_decide_unknown_request_and_action() {
    let env = TestEnv::new().await;

    let err = env
        .state
        .leave
        .decide(424242, env.admin_id, decision("APPROVE"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let request = env
        .state
        .leave
        .create(env.user_id, leave_input(env.policy_id, "2025-01-06", "2025-01-06"))
        .await
        .unwrap();
    let err = env
        .state
        .leave
        .decide(request.request_id, env.admin_id, decision("ESCALATE"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidAction(_)));
    assert_eq!(
        env.state.leave.get(request.request_id).await.unwrap().status,
        LeaveStatus::Pending
    );
}

#[tokio::test]
async fn test_create_rejects_request_beyond_balance() {
    let env = TestEnv::new().await;

    // 40 个工作日，额度 20
    let err = env
        .state
        .leave
        .create(env.user_id, leave_input(env.policy_id, "2025-01-06", "2025-02-28"))
        .await
        .unwrap_err();
    match err {
        AppError::InsufficientBalance {
            available,
            requested,
        } => {
            assert_eq!(available, Decimal::from(ANNUAL_LIMIT));
            assert_eq!(requested, Decimal::from(40));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.code(), "INSUFFICIENT_BALANCE");

    let page = env
        .state
        .leave
        .list(LeaveRequestFilters {
            user_id: Some(env.user_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total_elements, 0);
    assert_eq!(env.balance_2025().await, Decimal::from(ANNUAL_LIMIT));

    // 恰好用完余额的申请可以提交
    let request = env
        .state
        .leave
        .create(env.user_id, leave_input(env.policy_id, "2025-01-06", "2025-01-31"))
        .await
        .unwrap();
    assert_eq!(request.status, LeaveStatus::Pending);
}

#[tokio::test]
async fn test_create_checks_remaining_balance_not_annual_limit() {
    let env = TestEnv::new().await;
    env.store
        .set_balance(env.user_id, env.policy_id, 2025, Some(Decimal::from(2)))
        .await;

    let err = env
        .state
        .leave
        .create(env.user_id, leave_input(env.policy_id, "2025-01-06", "2025-01-08"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::InsufficientBalance { available, .. } if available == Decimal::from(2)
    ));

    // 允许负余额时不做预检
    let env = TestEnv::with_leave_settings(LeaveSettings {
        negative_balance: NegativeBalancePolicy::Allow,
        ..LeaveSettings::default()
    })
    .await;
    env.state
        .leave
        .create(env.user_id, leave_input(env.policy_id, "2025-01-06", "2025-02-28"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_insufficient_balance_rolls_back() {
    let env = TestEnv::new().await;
    let mut events = env.state.events.subscribe();

    let request = env
        .state
        .leave
        .create(env.user_id, leave_input(env.policy_id, "2025-01-06", "2025-01-08"))
        .await
        .unwrap();

    // 提交后余额被其他扣减占用
    env.store
        .set_balance(env.user_id, env.policy_id, 2025, Some(Decimal::from(2)))
        .await;

    let err = env
        .state
        .leave
        .decide(request.request_id, env.admin_id, decision("APPROVE"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InsufficientBalance { .. }));

    let current = env.state.leave.get(request.request_id).await.unwrap();
    assert_eq!(current.status, LeaveStatus::Pending);
    assert_eq!(current.days_deducted, None);
    assert_eq!(env.balance_2025().await, Decimal::from(2));
    assert!(events.try_recv().is_err());
    assert!(env
        .state
        .leave
        .audit_trail(request.request_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_allow_policy_lets_balance_go_negative_and_reconcile_reports_it() {
    let env = TestEnv::with_leave_settings(LeaveSettings {
        negative_balance: NegativeBalancePolicy::Allow,
        ..LeaveSettings::default()
    })
    .await;
    env.store
        .set_balance(env.user_id, env.policy_id, 2025, Some(Decimal::from(1)))
        .await;

    let request = env
        .state
        .leave
        .create(env.user_id, leave_input(env.policy_id, "2025-01-06", "2025-01-07"))
        .await
        .unwrap();
    env.state
        .leave
        .decide(request.request_id, env.admin_id, decision("APPROVE"))
        .await
        .unwrap();

    assert_eq!(env.balance_2025().await, Decimal::from(-1));

    let report = env.state.ledger.reconcile().await.unwrap();
    assert_eq!(report.negative_count, 1);
    assert!(!report.is_clean());
}

#[tokio::test]
async fn test_cancel_approved_request_credits_back() {
    let env = TestEnv::new().await;
    let mut events = env.state.events.subscribe();

    let request = env
        .state
        .leave
        .create(env.user_id, leave_input(env.policy_id, "2025-04-07", "2025-04-09"))
        .await
        .unwrap();
    env.state
        .leave
        .decide(request.request_id, env.admin_id, decision("APPROVE"))
        .await
        .unwrap();
    assert_eq!(env.balance_2025().await, Decimal::from(ANNUAL_LIMIT - 3));
    assert!(events.try_recv().is_ok());

    let cancelled = env
        .state
        .leave
        .decide(request.request_id, env.user_id, decision("CANCEL"))
        .await
        .unwrap();
    assert_eq!(cancelled.status, LeaveStatus::Cancelled);
    assert_eq!(env.balance_2025().await, Decimal::from(ANNUAL_LIMIT));
    assert!(events.try_recv().is_err());

    // 再次取消是空操作，不会重复返还
    env.state
        .leave
        .decide(request.request_id, env.user_id, decision("CANCEL"))
        .await
        .unwrap();
    assert_eq!(env.balance_2025().await, Decimal::from(ANNUAL_LIMIT));

    let trail = env.state.leave.audit_trail(request.request_id).await.unwrap();
    let actions: Vec<LeaveStatus> = trail.iter().map(|entry| entry.action).collect();
    assert_eq!(actions, vec![LeaveStatus::Approved, LeaveStatus::Cancelled]);
    assert_eq!(trail[1].actor_id, env.user_id);
}

#[tokio::test]
async fn test_no_transition_out_of_terminal_state() {
    let env = TestEnv::new().await;

    let request = env
        .state
        .leave
        .create(env.user_id, leave_input(env.policy_id, "2025-05-05", "2025-05-05"))
        .await
        .unwrap();
    env.state
        .leave
        .decide(request.request_id, env.admin_id, decision("REJECT"))
        .await
        .unwrap();

    let err = env
        .state
        .leave
        .decide(request.request_id, env.admin_id, decision("APPROVE"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));
    assert_eq!(err.code(), "INVALID_STATE");
    assert_eq!(env.balance_2025().await, Decimal::from(ANNUAL_LIMIT));
}

#[tokio::test]
async fn test_concurrent_approvals_debit_once() {
    let env = TestEnv::new().await;
    let mut events = env.state.events.subscribe();

    let request = env
        .state
        .leave
        .create(env.user_id, leave_input(env.policy_id, "2025-06-02", "2025-06-06"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let leave = env.state.leave.clone();
        let admin_id = env.admin_id;
        let request_id = request.request_id;
        handles.push(tokio::spawn(async move {
            leave
                .decide(request_id, admin_id, decision("APPROVE"))
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().status, LeaveStatus::Approved);
    }

    assert_eq!(env.balance_2025().await, Decimal::from(ANNUAL_LIMIT - 5));
    assert!(events.try_recv().is_ok());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_deadline_exceeded_leaves_request_untouched() {
    let env = TestEnv::with_leave_settings(LeaveSettings {
        deadline: Duration::from_millis(20),
        ..LeaveSettings::default()
    })
    .await;

    let request = env
        .state
        .leave
        .create(env.user_id, leave_input(env.policy_id, "2025-07-07", "2025-07-08"))
        .await
        .unwrap();

    env.store.set_latency(Duration::from_millis(200));
    let err = env
        .state
        .leave
        .decide(request.request_id, env.admin_id, decision("APPROVE"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Timeout(_)));
    env.store.set_latency(Duration::ZERO);

    assert_eq!(
        env.state.leave.get(request.request_id).await.unwrap().status,
        LeaveStatus::Pending
    );
    assert_eq!(env.balance_2025().await, Decimal::from(ANNUAL_LIMIT));
}

#[tokio::test]
async fn test_approved_scope_rechecks_before_approval() {
    let env = TestEnv::with_leave_settings(LeaveSettings {
        overlap_scope: OverlapScope::Approved,
        ..LeaveSettings::default()
    })
    .await;
    let leave = &env.state.leave;

    let first = leave
        .create(env.user_id, leave_input(env.policy_id, "2025-08-04", "2025-08-06"))
        .await
        .unwrap();
    // 待审批之间允许相交
    let second = leave
        .create(env.user_id, leave_input(env.policy_id, "2025-08-05", "2025-08-07"))
        .await
        .unwrap();

    leave
        .decide(first.request_id, env.admin_id, decision("APPROVE"))
        .await
        .unwrap();
    let err = leave
        .decide(second.request_id, env.admin_id, decision("APPROVE"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Overlap { .. }));

    // 与已批准申请相交的新申请被拒绝
    let err = leave
        .create(env.user_id, leave_input(env.policy_id, "2025-08-06", "2025-08-06"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Overlap { .. }));
}

#[tokio::test]
async fn test_list_requests_paginates_and_filters() {
    let env = TestEnv::new().await;
    let leave = &env.state.leave;

    for (start, end) in [
        ("2025-01-06", "2025-01-06"),
        ("2025-01-13", "2025-01-14"),
        ("2025-01-20", "2025-01-21"),
    ] {
        leave
            .create(env.user_id, leave_input(env.policy_id, start, end))
            .await
            .unwrap();
    }

    let page = leave
        .list(LeaveRequestFilters {
            user_id: Some(env.user_id),
            size: Some(2),
            sort: Some("start_date,asc".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total_elements, 3);
    assert_eq!(page.total_pages, 2);
    assert_eq!(page.content.len(), 2);
    assert_eq!(page.content[0].start_date.to_string(), "2025-01-06");

    // 非白名单排序字段回退为 created_at
    let page = leave
        .list(LeaveRequestFilters {
            sort: Some("reason; DROP TABLE leave_requests,asc".to_string()),
            page: Some(2),
            size: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.page, 2);
    assert_eq!(page.content.len(), 1);

    let page = leave
        .list(LeaveRequestFilters {
            status: Some("approved".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total_elements, 0);

    let err = leave
        .list(LeaveRequestFilters {
            size: Some(1000),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_summary_groups_by_policy() {
    let env = TestEnv::new().await;
    let sick = env.store.add_policy("Sick", Decimal::from(10), true).await;
    let leave = &env.state.leave;

    let mut decided = Vec::new();
    for (policy_id, start, end, action) in [
        (env.policy_id, "2025-03-03", "2025-03-07", Some("APPROVE")),
        (env.policy_id, "2025-03-17", "2025-03-18", None),
        (env.policy_id, "2025-03-24", "2025-03-24", Some("REJECT")),
        (sick, "2025-04-01", "2025-04-02", Some("APPROVE")),
        (sick, "2025-04-07", "2025-04-07", Some("APPROVE")),
        (env.policy_id, "2025-06-02", "2025-06-02", None),
    ] {
        let request = leave
            .create(env.user_id, leave_input(policy_id, start, end))
            .await
            .unwrap();
        if let Some(action) = action {
            leave
                .decide(request.request_id, env.admin_id, decision(action))
                .await
                .unwrap();
        }
        decided.push(request.request_id);
    }
    leave
        .decide(decided[4], env.user_id, decision("CANCEL"))
        .await
        .unwrap();
    let half_day = leave
        .create(env.user_id, half_day_input(env.policy_id, "2025-03-10"))
        .await
        .unwrap();
    leave
        .decide(half_day.request_id, env.admin_id, decision("APPROVE"))
        .await
        .unwrap();

    let report = leave
        .summary(LeaveSummaryFilters {
            from: Some("2025-03-01".to_string()),
            to: Some("2025-04-30".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(report.policies.len(), 2);
    let annual = &report.policies[0];
    assert_eq!(annual.policy_name, "Annual");
    assert_eq!(annual.total_requests, 4);
    assert_eq!(annual.pending, 1);
    assert_eq!(annual.approved, 2);
    assert_eq!(annual.rejected, 1);
    assert_eq!(annual.cancelled, 0);
    assert_eq!(annual.approved_days, Decimal::new(55, 1));

    let sick_summary = &report.policies[1];
    assert_eq!(sick_summary.policy_id, sick);
    assert_eq!(sick_summary.approved, 1);
    assert_eq!(sick_summary.cancelled, 1);
    assert_eq!(sick_summary.approved_days, Decimal::from(2));

    assert_eq!(report.totals.total_requests, 6);
    assert_eq!(report.totals.approved, 3);
    assert_eq!(report.totals.approved_days, Decimal::new(75, 1));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["totals"]["approved_days"], serde_json::json!(7.5));
    assert_eq!(json["from"], serde_json::json!("2025-03-01"));

    // 不限日期时包含区间外的申请
    let report = leave.summary(LeaveSummaryFilters::default()).await.unwrap();
    assert_eq!(report.policies[0].total_requests, 5);
    assert_eq!(report.policies[0].pending, 2);
    assert_eq!(report.totals.total_requests, 7);
}

#[tokio::test]
async fn test_summary_rejects_bad_range() {
    let env = TestEnv::new().await;

    let report = env
        .state
        .leave
        .summary(LeaveSummaryFilters::default())
        .await
        .unwrap();
    assert!(report.policies.is_empty());
    assert_eq!(report.totals.total_requests, 0);

    let err = env
        .state
        .leave
        .summary(LeaveSummaryFilters {
            from: Some("2025-05-01".to_string()),
            to: Some("2025-04-01".to_string()),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_DATE_RANGE");

    let err = env
        .state
        .leave
        .summary(LeaveSummaryFilters {
            from: Some("May 1st".to_string()),
            to: None,
        })
        .await
        .unwrap_err();
    assert!(err.is_client_error());
}
