/// Generate the default TOML config content with comments.
pub(crate) fn default_config_toml() -> String {
    r##"# Parley Configuration
# Schema version 1
# Only override what you want to change -- missing fields use defaults.

[session]
api = "http://localhost:3000/api/chat"
# id = "my-conversation"            # fixed chat id; random when unset
# max_steps = 1                     # 1-100, >1 enables automatic tool continuation
# stream_mode = "structured"        # structured, plain
# send_extra_message_fields = false
# drop_last_message_on_error = false
# deferred_resubmit = "post-completion"   # post-completion, origin-snapshot
# credentials = "same-origin"       # omit, same-origin, include

[request.headers]
# Authorization = "Bearer ..."

[request.body]
# model = "gpt-4o"

[logging]
# level = "info"                    # trace, debug, info, warn, error
"##
    .to_string()
}
