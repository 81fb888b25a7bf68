use config_store::StoredParameter;
use core_types::{
    new_id, Action, ActionKind, EntityId, GovernanceError, ParameterRef, ParameterState,
    VALUE_EPSILON,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Applied(Action),
    NoOp(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ActionContext {
    pub cycle_seq: u64,
    pub now_ms: i64,
}

/// Plans bounded steps and exact reverts, and is the only code that writes a
/// parameter value.
#[derive(Debug, Default, Clone, Copy)]
pub struct ActionExecutor;

impl ActionExecutor {
    pub fn step(
        &self,
        ctx: ActionContext,
        pref: &ParameterRef,
        param: &ParameterState,
        kind: ActionKind,
        reason: &str,
        streak_at_apply: u32,
    ) -> Result<ExecOutcome, GovernanceError> {
        let sign = match kind {
            ActionKind::Promote => param.promote_direction.sign(),
            ActionKind::Rollback => -param.promote_direction.sign(),
            ActionKind::Pause | ActionKind::Resume => {
                return Err(GovernanceError::InvalidParameter {
                    name: pref.to_string(),
                    reason: format!("{kind} is not a value step"),
                })
            }
        };
        let from = param.value;
        let to = (from + sign * param.step).clamp(param.min, param.max);
        if !to.is_finite() {
            return Err(GovernanceError::InvalidParameter {
                name: pref.to_string(),
                reason: "non-finite step result".to_string(),
            });
        }
        if (to - from).abs() <= VALUE_EPSILON {
            return Ok(ExecOutcome::NoOp(format!("{pref} at bound {from:.6}")));
        }
        if (to - param.baseline).abs() > param.max_cumulative_drift + VALUE_EPSILON {
            return Ok(ExecOutcome::NoOp(format!(
                "{pref} drift budget exhausted: |{to:.6}-{:.6}|>{:.6}",
                param.baseline, param.max_cumulative_drift
            )));
        }
        Ok(ExecOutcome::Applied(Action {
            id: new_id(),
            cycle_seq: ctx.cycle_seq,
            entity: pref.entity.clone(),
            parameter: Some(pref.name.clone()),
            kind,
            from_value: from,
            to_value: to,
            reason: reason.to_string(),
            streak_at_apply,
            reverts: None,
            ts_ms: ctx.now_ms,
        }))
    }

    /// Plan the exact undo of `original`. Refused when the parameter has moved since.
    pub fn revert(
        &self,
        ctx: ActionContext,
        original: &Action,
        param: &ParameterState,
        reason: &str,
        streak_at_apply: u32,
    ) -> ExecOutcome {
        let Some(pref) = original.parameter_ref() else {
            return ExecOutcome::NoOp(format!("action {} moved no parameter", original.id));
        };
        if (param.value - original.to_value).abs() > VALUE_EPSILON {
            return ExecOutcome::NoOp(format!(
                "{pref} moved since action {} ({:.6} != {:.6})",
                original.id, param.value, original.to_value
            ));
        }
        let target = original.from_value;
        let mut reverted = param.clone();
        reverted.value = target;
        if !reverted.within_invariants() {
            return ExecOutcome::NoOp(format!("{pref} revert target {target:.6} out of bounds"));
        }
        ExecOutcome::Applied(Action {
            id: new_id(),
            cycle_seq: ctx.cycle_seq,
            entity: original.entity.clone(),
            parameter: original.parameter.clone(),
            kind: ActionKind::Rollback,
            from_value: param.value,
            to_value: target,
            reason: reason.to_string(),
            streak_at_apply,
            reverts: Some(original.id.clone()),
            ts_ms: ctx.now_ms,
        })
    }

    /// Value-preserving entity-level action.
    pub fn status_change(
        &self,
        ctx: ActionContext,
        entity: &EntityId,
        kind: ActionKind,
        reason: &str,
        streak_at_apply: u32,
    ) -> Action {
        Action {
            id: new_id(),
            cycle_seq: ctx.cycle_seq,
            entity: entity.clone(),
            parameter: None,
            kind,
            from_value: 0.0,
            to_value: 0.0,
            reason: reason.to_string(),
            streak_at_apply,
            reverts: None,
            ts_ms: ctx.now_ms,
        }
    }

    /// Write an applied action into its stored parameter.
    pub fn commit(
        &self,
        stored: &mut StoredParameter,
        action: &Action,
        now_ms: i64,
    ) -> Result<(), GovernanceError> {
        let name = action
            .parameter_ref()
            .map(|p| p.to_string())
            .unwrap_or_else(|| action.entity.to_string());
        if (stored.state.value - action.from_value).abs() > VALUE_EPSILON {
            return Err(GovernanceError::InvalidParameter {
                name,
                reason: format!(
                    "stored value {:.6} does not match action origin {:.6}",
                    stored.state.value, action.from_value
                ),
            });
        }
        if (action.to_value - action.from_value).abs() > stored.state.step + VALUE_EPSILON {
            return Err(GovernanceError::InvalidParameter {
                name,
                reason: "move exceeds step".to_string(),
            });
        }
        let mut next = stored.state.clone();
        next.value = action.to_value;
        if !next.within_invariants() {
            return Err(GovernanceError::InvalidParameter {
                name,
                reason: "move breaks bounds or drift budget".to_string(),
            });
        }
        stored.set_value(action.to_value, now_ms);
        Ok(())
    }
}
