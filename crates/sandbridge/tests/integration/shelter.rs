use anyhow::{Context, Result};
use sandbridge::{Arg, Error, EvalOptions, SessionState, Value, ValueKind};

use super::common::{start, within};

#[tokio::test]
async fn integration_shelter_purge() -> Result<()> {
    let session = start().await?;
    let shelter = session.shelter()?;

    let proxy = within(shelter.evaluate("c(1, 2)", EvalOptions::new())).await?;
    let handle = proxy.handle();
    assert_eq!(shelter.len(), 1);
    assert_eq!(shelter.membership(handle), 1);
    assert!(within(session.is_retained(handle)).await?);

    shelter.purge()?;
    assert!(shelter.is_empty());
    assert_eq!(shelter.membership(handle), 0);
    assert!(!proxy.is_live());
    assert!(!within(session.is_retained(handle)).await?);

    let err = within(proxy.to_value())
        .await
        .expect_err("expected purged proxy to be unusable");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Lifetime { .. })));

    // Purging again is a no-op, and the shelter stays usable.
    shelter.purge()?;
    let again = within(shelter.evaluate("3", EvalOptions::new())).await?;
    assert_eq!(within(again.to_serde::<f64>()).await?, 3.0);
    Ok(())
}

#[tokio::test]
async fn integration_shelter_retention_follows_membership() -> Result<()> {
    let session = start().await?;
    let shelter = session.shelter()?;

    let kept = within(shelter.evaluate("'kept'", EvalOptions::new())).await?;
    let dropped = within(shelter.evaluate("'dropped'", EvalOptions::new())).await?;
    let (kept_handle, dropped_handle) = (kept.handle(), dropped.handle());

    session.destroy(dropped)?;
    within(session.sync()).await?;
    for handle in [kept_handle, dropped_handle] {
        assert_eq!(
            within(session.is_retained(handle)).await?,
            shelter.membership(handle) > 0,
            "expected retention of {handle} to match its membership"
        );
    }
    assert_eq!(shelter.handles(), [kept_handle]);
    assert!(kept.is_live());
    Ok(())
}

#[tokio::test]
async fn integration_shelter_nested() -> Result<()> {
    let session = start().await?;
    let parent = session.shelter()?;
    let child = parent.nested()?;

    let outer = within(parent.evaluate("1", EvalOptions::new())).await?;
    let inner = within(child.evaluate("2", EvalOptions::new())).await?;

    parent.purge()?;
    assert!(!outer.is_live());
    assert!(!inner.is_live());

    // Purging empties the child without removing it.
    let value = within(child.evaluate("4", EvalOptions::new())).await?;
    assert_eq!(within(value.to_serde::<f64>()).await?, 4.0);
    Ok(())
}

#[tokio::test]
async fn integration_shelter_drop_releases() -> Result<()> {
    let session = start().await?;

    let proxy = {
        let shelter = session.shelter()?;
        within(shelter.evaluate("'scoped'", EvalOptions::new())).await?
    };
    assert!(!proxy.is_live());
    within(session.sync()).await?;
    assert!(!within(session.is_retained(proxy.handle())).await?);

    let gone = session.shelter()?;
    let options = EvalOptions::new().shelter(&gone);
    drop(gone);
    let err = within(session.evaluate("1", options))
        .await
        .expect_err("expected dropped shelter to be unknown");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnknownShelter(_))));
    Ok(())
}

#[tokio::test]
async fn integration_shelter_default_survives_purge() -> Result<()> {
    let session = start().await?;
    let default = session.default_shelter();

    let before = default.len();
    let proxy = within(session.evaluate("1", EvalOptions::new())).await?;
    assert_eq!(proxy.shelter(), default.id());
    assert_eq!(default.len(), before + 1);

    default.purge()?;
    assert!(default.is_empty());
    within(session.evaluate("2", EvalOptions::new())).await?;
    assert_eq!(default.len(), 1);
    Ok(())
}

#[tokio::test]
async fn integration_shelter_call_result_joins_function_shelter() -> Result<()> {
    let session = start().await?;
    let shelter = session.shelter()?;

    let double = within(shelter.evaluate("function(x) x * 2", EvalOptions::new())).await?;
    let result = within(double.call([Arg::value(Value::from_serde(&4)?)])).await?;
    assert_eq!(result.shelter(), shelter.id());
    assert_eq!(shelter.len(), 2);
    assert_eq!(within(result.to_serde::<f64>()).await?, 8.0);

    let err = within(result.call([]))
        .await
        .expect_err("expected a number not to be callable");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::KindMismatch {
            expected: ValueKind::Function,
            ..
        })
    ));
    Ok(())
}

#[tokio::test]
async fn integration_shelter_proxy_arguments() -> Result<()> {
    let session = start().await?;
    let shelter = session.shelter()?;

    let values = within(shelter.evaluate("c(3, 4)", EvalOptions::new())).await?;
    let total = within(session.evaluate_value(
        "sum(v)",
        EvalOptions::new().bind_proxy("v", &values)?,
    ))
    .await?;
    assert_eq!(total.to_serde::<f64>()?, 7.0);

    shelter.purge()?;
    let err = EvalOptions::new()
        .bind_proxy("v", &values)
        .expect_err("expected purged proxy to be rejected");
    assert!(matches!(err, Error::Lifetime { .. }));
    Ok(())
}

#[tokio::test]
async fn integration_shelter_stale_handle_is_lifetime_error() -> Result<()> {
    let session = start().await?;
    let shelter = session.shelter()?;

    let values = within(shelter.evaluate("c(1, 2)", EvalOptions::new())).await?;
    let stale = values.arg()?;
    shelter.purge()?;
    within(session.sync()).await?;

    let err = within(session.bind("x", stale.clone()))
        .await
        .expect_err("expected released handle to be rejected");
    let err = err
        .downcast_ref::<Error>()
        .context("expected a bridge error")?;
    assert!(
        matches!(err, Error::Lifetime { handle } if *handle == values.handle()),
        "expected lifetime error, got {err:?}"
    );
    assert!(!err.is_fatal());

    let sqrt = within(session.evaluate("sqrt", EvalOptions::new())).await?;
    let err = within(sqrt.call([Arg::value(stale)]))
        .await
        .expect_err("expected released argument to be rejected");
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Lifetime { .. })));

    assert_eq!(session.state(), SessionState::Ready);
    let value = within(session.evaluate_value("1 + 1", EvalOptions::new())).await?;
    assert_eq!(value.to_serde::<f64>()?, 2.0);
    Ok(())
}
