//! Static JSON fixtures shared by the unit tests.
//!
//! Exporting each const allows all the test data to have a single source
//! of truth.

use lazy_static::lazy_static;
use serde_json::{json, Value as JsonValue};

lazy_static! {
    pub static ref MEMBER: JsonValue = json!({
        "content": {
            "avatar_url": null,
            "displayname": "example",
            "membership": "join"
        },
        "event_id": "$151800140517rfvjc:localhost",
        "membership": "join",
        "origin_server_ts": 151800140,
        "sender": "@example:localhost",
        "state_key": "@example:localhost",
        "type": "m.room.member",
        "unsigned": {
            "age": 297036
        }
    });
}

lazy_static! {
    pub static ref TYPING: JsonValue = json!({
        "content": {
            "user_ids": [
                "@alice:matrix.org",
                "@bob:example.com"
            ]
        },
        "type": "m.typing"
    });
}

lazy_static! {
    pub static ref RECEIPT: JsonValue = json!({
        "content": {
            "$152037280074GZeOm:localhost": {
                "m.read": {
                    "@example:localhost": {
                        "ts": 1520372804619u64
                    }
                }
            }
        },
        "type": "m.receipt"
    });
}

lazy_static! {
    pub static ref LOGIN: JsonValue = json!({
        "access_token": "abc123",
        "device_id": "GHTYAJCE",
        "home_server": "matrix.org",
        "user_id": "@cheeky_monkey:matrix.org"
    });
}

lazy_static! {
    pub static ref SYNC: JsonValue = json!({
        "device_one_time_keys_count": {},
        "next_batch": "s526_47314_0_7_1_1_1_11444_1",
        "device_lists": {
            "changed": [],
            "left": []
        },
        "rooms": {
            "invite": {},
            "join": {
                "!SVkFJHzfwvuaIEawgC:localhost": {
                    "summary": {},
                    "account_data": {
                        "events": [
                            {
                                "content": {
                                    "tags": {
                                        "u.work": {
                                            "order": 0.9
                                        }
                                    }
                                },
                                "type": "m.tag"
                            }
                        ]
                    },
                    "ephemeral": {
                        "events": [
                            {
                                "content": {
                                    "$152037280074GZeOm:localhost": {
                                        "m.read": {
                                            "@seen:localhost": {
                                                "ts": 1520372804619u64
                                            }
                                        }
                                    }
                                },
                                "type": "m.receipt"
                            }
                        ]
                    },
                    "state": {
                        "events": [
                            {
                                "content": {
                                    "creator": "@example:localhost"
                                },
                                "event_id": "$15139375510KUZHi:localhost",
                                "origin_server_ts": 151393755,
                                "sender": "@example:localhost",
                                "state_key": "",
                                "type": "m.room.create",
                                "unsigned": {
                                    "age": 703422
                                }
                            },
                            {
                                "content": {
                                    "avatar_url": null,
                                    "displayname": "example",
                                    "membership": "join"
                                },
                                "event_id": "$151800140517rfvjc:localhost",
                                "origin_server_ts": 151800140,
                                "sender": "@example:localhost",
                                "state_key": "@example:localhost",
                                "type": "m.room.member",
                                "unsigned": {
                                    "age": 297036
                                }
                            }
                        ]
                    },
                    "timeline": {
                        "events": [
                            {
                                "content": {
                                    "body": "baba",
                                    "format": "org.matrix.custom.html",
                                    "formatted_body": "<strong>baba</strong>",
                                    "msgtype": "m.text"
                                },
                                "event_id": "$152037280074GZeOm:localhost",
                                "origin_server_ts": 152037280,
                                "sender": "@example:localhost",
                                "type": "m.room.message",
                                "unsigned": {
                                    "age": 598971
                                }
                            }
                        ],
                        "limited": false,
                        "prev_batch": "t392-516_47314_0_7_1_1_1_11444_1"
                    },
                    "unread_notifications": {
                        "highlight_count": 0,
                        "notification_count": 11
                    }
                }
            },
            "leave": {}
        },
        "account_data": {
            "events": [
                {
                    "content": {
                        "ignored_users": {
                            "@someone:example.org": {}
                        }
                    },
                    "type": "m.ignored_user_list"
                }
            ]
        },
        "presence": {
            "events": []
        },
        "to_device": {
            "events": []
        }
    });
}

lazy_static! {
    pub static ref INVITE_SYNC: JsonValue = json!({
        "next_batch": "s526_47314_0_7_1_1_1_11444_2",
        "rooms": {
            "invite": {
                "!696r7674:localhost": {
                    "invite_state": {
                        "events": [
                            {
                                "content": {
                                    "name": "My Room Name"
                                },
                                "sender": "@example:localhost",
                                "state_key": "",
                                "type": "m.room.name"
                            },
                            {
                                "content": {
                                    "membership": "invite"
                                },
                                "sender": "@example:localhost",
                                "state_key": "@cheeky_monkey:matrix.org",
                                "type": "m.room.member"
                            }
                        ]
                    }
                }
            },
            "join": {},
            "leave": {}
        }
    });
}
