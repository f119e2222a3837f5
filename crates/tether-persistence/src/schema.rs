// Table definitions for the runtime's store. Metadata and scope lists are
// serialized as JSON text so the layout stays portable across the postgres
// and sqlite migration dialects.

diesel::table! {
	connection (id) {
		id -> Text,
		provider_id -> Text,
		scope_type -> Text,
		scope_id -> Text,
		external_account_id -> Text,
		status -> Text,
		inherits_from -> Nullable<Text>,
		last_error -> Nullable<Text>,
		created_at -> Timestamptz,
		updated_at -> Timestamptz,
		deleted_at -> Nullable<Timestamptz>,
	}
}

diesel::table! {
	credential (id) {
		id -> Text,
		connection_id -> Text,
		version -> Int4,
		encrypted_payload -> Bytea,
		payload_format -> Text,
		payload_version -> Int4,
		token_type -> Text,
		requested_scopes -> Text,
		granted_scopes -> Text,
		expires_at -> Nullable<Timestamptz>,
		rotates_at -> Nullable<Timestamptz>,
		refreshable -> Bool,
		status -> Text,
		grant_version -> Int4,
		encryption_key_id -> Text,
		encryption_version -> Int4,
		revocation_reason -> Nullable<Text>,
		created_at -> Timestamptz,
		updated_at -> Timestamptz,
	}
}

diesel::table! {
	grant_snapshot (connection_id, version) {
		connection_id -> Text,
		version -> Int4,
		requested -> Text,
		granted -> Text,
		captured_at -> Timestamptz,
		metadata -> Text,
	}
}

diesel::table! {
	grant_event (id) {
		id -> Text,
		connection_id -> Text,
		event_type -> Text,
		added -> Text,
		removed -> Text,
		occurred_at -> Timestamptz,
		metadata -> Text,
	}
}

diesel::table! {
	installation (id) {
		id -> Text,
		provider_id -> Text,
		scope_type -> Text,
		scope_id -> Text,
		install_type -> Text,
		status -> Text,
		granted_at -> Nullable<Timestamptz>,
		revoked_at -> Nullable<Timestamptz>,
		metadata -> Text,
		created_at -> Timestamptz,
		updated_at -> Timestamptz,
	}
}

diesel::table! {
	subscription (id) {
		id -> Text,
		connection_id -> Text,
		provider_id -> Text,
		resource_type -> Text,
		resource_id -> Text,
		channel_id -> Text,
		remote_subscription_id -> Nullable<Text>,
		callback_url -> Text,
		verification_token_ref -> Nullable<Text>,
		status -> Text,
		expires_at -> Nullable<Timestamptz>,
		last_notified_at -> Nullable<Timestamptz>,
		metadata -> Text,
		created_at -> Timestamptz,
		updated_at -> Timestamptz,
		deleted_at -> Nullable<Timestamptz>,
	}
}

diesel::table! {
	sync_cursor (connection_id, resource_type, resource_id) {
		connection_id -> Text,
		resource_type -> Text,
		resource_id -> Text,
		provider_id -> Text,
		cursor -> Text,
		status -> Text,
		last_synced_at -> Nullable<Timestamptz>,
		metadata -> Text,
		updated_at -> Timestamptz,
	}
}

diesel::table! {
	sync_job (id) {
		id -> Text,
		connection_id -> Text,
		provider_id -> Text,
		mode -> Text,
		checkpoint -> Nullable<Text>,
		status -> Text,
		attempts -> Int4,
		next_attempt_at -> Nullable<Timestamptz>,
		last_error -> Nullable<Text>,
		metadata -> Text,
		created_at -> Timestamptz,
		updated_at -> Timestamptz,
	}
}

diesel::table! {
	sync_job_idempotency (id) {
		id -> Text,
		scope_type -> Text,
		scope_id -> Text,
		provider_id -> Text,
		connection_id -> Text,
		mode -> Text,
		idempotency_key -> Text,
		sync_job_id -> Text,
		requested_by -> Nullable<Text>,
		created_at -> Timestamptz,
	}
}

diesel::table! {
	webhook_delivery (provider_id, delivery_id) {
		provider_id -> Text,
		delivery_id -> Text,
		status -> Text,
		attempts -> Int4,
		next_attempt_at -> Nullable<Timestamptz>,
		payload -> Bytea,
		last_error -> Nullable<Text>,
		created_at -> Timestamptz,
		updated_at -> Timestamptz,
	}
}

diesel::table! {
	rate_limit_state (provider_id, scope_type, scope_id, bucket_key) {
		provider_id -> Text,
		scope_type -> Text,
		scope_id -> Text,
		bucket_key -> Text,
		limit_value -> Nullable<Int8>,
		remaining -> Nullable<Int8>,
		reset_at -> Nullable<Timestamptz>,
		retry_after_seconds -> Nullable<Int8>,
		metadata -> Text,
		updated_at -> Timestamptz,
	}
}

diesel::table! {
	lifecycle_outbox (event_id) {
		event_id -> Text,
		event_name -> Text,
		provider_id -> Text,
		scope_type -> Text,
		scope_id -> Text,
		connection_id -> Nullable<Text>,
		payload -> Text,
		metadata -> Text,
		status -> Text,
		attempts -> Int4,
		next_attempt_at -> Nullable<Timestamptz>,
		last_error -> Nullable<Text>,
		occurred_at -> Timestamptz,
		created_at -> Timestamptz,
		updated_at -> Timestamptz,
	}
}

diesel::table! {
	notification_dispatch (idempotency_key) {
		idempotency_key -> Text,
		event_id -> Text,
		projector -> Text,
		definition_code -> Text,
		recipient_key -> Text,
		status -> Text,
		error -> Nullable<Text>,
		metadata -> Text,
		created_at -> Timestamptz,
	}
}

diesel::table! {
	service_activity (id) {
		id -> Text,
		provider_id -> Text,
		scope_type -> Text,
		scope_id -> Text,
		connection_id -> Nullable<Text>,
		installation_id -> Nullable<Text>,
		subscription_id -> Nullable<Text>,
		sync_job_id -> Nullable<Text>,
		channel -> Text,
		action -> Text,
		object_type -> Text,
		object_id -> Text,
		actor -> Text,
		actor_type -> Text,
		status -> Text,
		metadata -> Text,
		created_at -> Timestamptz,
	}
}

diesel::allow_tables_to_appear_in_same_query!(
	connection,
	credential,
	grant_snapshot,
	grant_event,
	installation,
	subscription,
	sync_cursor,
	sync_job,
	sync_job_idempotency,
	webhook_delivery,
	rate_limit_state,
	lifecycle_outbox,
	notification_dispatch,
	service_activity,
);
